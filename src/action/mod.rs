//! Action plugins and the registry that maps action names to them.
//!
//! An action is constructed per job from an [`ActionFactory`] and run once by
//! an executor worker under its declared [`Action::timeout`]. Registration is
//! explicit: [`builtin_registry`] lists every compiled-in action.

pub mod cleanup;
pub mod dummy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::job::Job;
use crate::store::ResourceStore;

pub use cleanup::JobsCleanup;
pub use dummy::DummyTestAction;

/// What an executor hands to each action it constructs.
#[derive(Clone)]
pub struct ExecutorContext {
    store: Arc<dyn ResourceStore>,
    worker: String,
    released: CancellationToken,
}

impl ExecutorContext {
    pub fn new(store: Arc<dyn ResourceStore>, worker: impl Into<String>) -> Self {
        Self {
            store,
            worker: worker.into(),
            released: CancellationToken::new(),
        }
    }

    pub fn with_release(mut self, released: CancellationToken) -> Self {
        self.released = released;
        self
    }

    /// Cancelled once the executor stops waiting for the action, on timeout
    /// or after recording its result. Long-running actions may watch it to
    /// stop early; the job handle refuses writes from then on.
    pub fn released(&self) -> &CancellationToken {
        &self.released
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Name of the worker running the action.
    pub fn worker(&self) -> &str {
        &self.worker
    }
}

/// A unit of business logic processing one job.
///
/// `do_work` returns the job's return code; any error marks the job FAILED.
/// It runs on its own task and is abandoned, not aborted, once `timeout`
/// has elapsed. An abandoned action can no longer write to its job.
#[async_trait]
pub trait Action: Send {
    fn timeout(&self) -> Duration;

    async fn do_work(&mut self) -> anyhow::Result<i64>;
}

pub type ActionFactory = Arc<dyn Fn(ExecutorContext, Job) -> Box<dyn Action> + Send + Sync>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Action {0} is already registered")]
    Duplicate(String),
}

/// Name -> factory map, filled at startup and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`. A second registration of the same
    /// name is rejected and the first one stays in place.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(ExecutorContext, Job) -> Box<dyn Action> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            tracing::error!(action = %name, "Action registered twice, keeping the first registration");
            return Err(RegistryError::Duplicate(name));
        }

        tracing::debug!(action = %name, "Registered action");
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<ActionFactory> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Registry with every compiled-in action.
pub fn builtin_registry() -> Result<ActionRegistry, RegistryError> {
    let mut registry = ActionRegistry::new();
    registry.register(dummy::NAME, |_ctx, job| {
        Box::new(DummyTestAction::new(job)) as Box<dyn Action>
    })?;
    registry.register(cleanup::NAME, |ctx, job| {
        Box::new(JobsCleanup::new(ctx, job)) as Box<dyn Action>
    })?;
    Ok(registry)
}
