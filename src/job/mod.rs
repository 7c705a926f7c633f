//! The job entity: a read-only local projection of a remote job document.
//!
//! Every mutator on [`Job`] goes through the [`ResourceStore`] and replaces the
//! local projection with the document the store returns. There is no way to
//! change a field locally without that round trip.

mod record;
mod state;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::store::{ConflictRetry, Document, ResourceStore, StoreError};

pub(crate) use record::JobRecord;
pub use record::{NewJob, ResourceRef};
pub use state::JobState;

/// Collection jobs are created in.
pub const JOB_COLLECTION: &str = "jobs";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job {0} does not exist")]
    Missing(String),

    #[error("Progress must be between 0 and 100, got {0}")]
    InvalidProgress(u32),

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Job {id} is already {state}")]
    Finished { id: String, state: JobState },

    #[error("Job {0} was released by its worker and no longer accepts writes")]
    Released(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// True when the store rejected the write because of a concurrent edit.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            JobError::Store(StoreError::Conflict(_) | StoreError::RetriesExhausted { .. })
        )
    }
}

/// Multi-attribute edit applied in a single request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub return_code: Option<i64>,
    pub status_message: Option<String>,
}

impl JobUpdate {
    pub fn success(return_code: i64) -> Self {
        Self {
            state: Some(JobState::Success),
            return_code: Some(return_code),
            status_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: Some(JobState::Failed),
            return_code: None,
            status_message: Some(message.into()),
        }
    }

    pub fn stopped() -> Self {
        Self {
            state: Some(JobState::Stopped),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.return_code.is_none() && self.status_message.is_none()
    }

    fn to_document(&self) -> Document {
        let mut fields = Map::new();
        if let Some(state) = self.state {
            fields.insert("state".into(), json!(state));
        }
        if let Some(rc) = self.return_code {
            fields.insert("returnCode".into(), json!(rc));
        }
        if let Some(message) = &self.status_message {
            fields.insert("statusMessage".into(), json!(message));
        }
        Value::Object(fields)
    }
}

#[derive(Clone)]
pub struct Job {
    record: JobRecord,
    store: Arc<dyn ResourceStore>,
    retry: ConflictRetry,
    released: CancellationToken,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("record", &self.record).finish()
    }
}

impl Job {
    /// Fetches the job document. A missing document is reported as
    /// [`JobError::Missing`].
    pub async fn load(store: Arc<dyn ResourceStore>, id: &str) -> Result<Self, JobError> {
        let doc = store.get(id).await.map_err(|e| match e {
            StoreError::NotFound(_) => JobError::Missing(id.to_string()),
            other => JobError::Store(other),
        })?;

        Ok(Self {
            record: parse(doc)?,
            store,
            retry: ConflictRetry::default(),
            released: CancellationToken::new(),
        })
    }

    pub fn with_retry(mut self, retry: ConflictRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Ties this handle to `released`. Once it is cancelled every mutator
    /// fails with [`JobError::Released`] without touching the store.
    pub fn bound_to(mut self, released: CancellationToken) -> Self {
        self.released = released;
        self
    }

    /// True once the handle was released and can no longer write.
    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }

    /// Re-reads the document from the store.
    pub async fn refresh(&mut self) -> Result<(), JobError> {
        let doc = self.store.get(&self.record.id).await.map_err(|e| match e {
            StoreError::NotFound(_) => JobError::Missing(self.record.id.clone()),
            other => JobError::Store(other),
        })?;
        self.record = parse(doc)?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn action(&self) -> Option<&str> {
        self.record.action.as_deref()
    }

    pub fn target_resource(&self) -> Option<&ResourceRef> {
        self.record.target_resource.as_ref()
    }

    pub fn state(&self) -> JobState {
        self.record.state
    }

    pub fn progress(&self) -> u8 {
        self.record.progress
    }

    pub fn status_message(&self) -> Option<&str> {
        self.record.status_message.as_deref()
    }

    pub fn return_code(&self) -> Option<i64> {
        self.record.return_code
    }

    pub fn affected_resources(&self) -> &[ResourceRef] {
        &self.record.affected_resources
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.record.created
    }

    pub fn is_terminal(&self) -> bool {
        self.record.state.is_terminal()
    }

    fn ensure_writable(&self) -> Result<(), JobError> {
        if self.is_released() {
            return Err(JobError::Released(self.record.id.clone()));
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), JobError> {
        self.ensure_writable()?;
        if self.is_terminal() {
            return Err(JobError::Finished {
                id: self.record.id.clone(),
                state: self.record.state,
            });
        }
        Ok(())
    }

    /// Sends `partial` and adopts the returned document.
    async fn edit(&mut self, partial: Document) -> Result<(), StoreError> {
        let doc = self.store.edit(&self.record.id, partial).await?;
        self.record = parse(doc)?;
        Ok(())
    }

    /// Same as [`Job::edit`] but re-sends on conflict.
    async fn edit_retrying(&mut self, partial: Document) -> Result<(), StoreError> {
        let store = self.store.clone();
        let id = self.record.id.clone();
        let doc = self
            .retry
            .run(&id, |_| {
                let store = store.clone();
                let partial = partial.clone();
                let id = id.clone();
                async move { store.edit(&id, partial).await }
            })
            .await?;
        self.record = parse(doc)?;
        Ok(())
    }

    /// Best-effort: a failed write is logged and the local projection kept.
    pub async fn set_progress(&mut self, progress: u32) -> Result<(), JobError> {
        if progress > 100 {
            return Err(JobError::InvalidProgress(progress));
        }
        self.ensure_active()?;

        if let Err(e) = self.edit(json!({ "progress": progress })).await {
            tracing::warn!(job_id = %self.record.id, progress, error = %e, "Failed to update job progress");
        }
        Ok(())
    }

    /// Best-effort, like [`Job::set_progress`].
    pub async fn set_status_message(&mut self, message: impl Into<String>) -> Result<(), JobError> {
        self.ensure_active()?;

        let message = message.into();
        if let Err(e) = self.edit(json!({ "statusMessage": message })).await {
            tracing::warn!(job_id = %self.record.id, error = %e, "Failed to update job status message");
        }
        Ok(())
    }

    pub async fn set_return_code(&mut self, return_code: i64) -> Result<(), JobError> {
        self.ensure_active()?;
        self.edit(json!({ "returnCode": return_code })).await?;
        Ok(())
    }

    /// Moves the job forward. Setting the current state again is a no-op.
    pub async fn set_state(&mut self, state: JobState) -> Result<(), JobError> {
        self.ensure_writable()?;
        let current = self.record.state;
        if current == state {
            return Ok(());
        }
        if !current.can_transition_to(state) {
            return Err(JobError::InvalidTransition {
                from: current,
                to: state,
            });
        }

        self.edit_retrying(json!({ "state": state })).await?;
        tracing::debug!(job_id = %self.record.id, from = %current, to = %state, "Job state changed");
        Ok(())
    }

    pub async fn add_affected_resource(&mut self, href: impl Into<String>) -> Result<(), JobError> {
        self.add_affected_resources([href.into()]).await
    }

    /// Appends the given references, skipping ones already recorded. On a
    /// conflicting write the current list is re-read and merged again, so
    /// entries written concurrently are never dropped.
    pub async fn add_affected_resources<I, S>(&mut self, hrefs: I) -> Result<(), JobError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_active()?;

        let additions: Vec<String> = hrefs.into_iter().map(Into::into).collect();
        let known = self.record.affected_resources.clone();
        let store = self.store.clone();
        let id = self.record.id.clone();

        let doc = self
            .retry
            .run(&id, |attempt| {
                let store = store.clone();
                let id = id.clone();
                let additions = additions.clone();
                let known = known.clone();
                async move {
                    let current = if attempt == 1 {
                        known
                    } else {
                        parse(store.get(&id).await?)?.affected_resources
                    };
                    match merge_refs(&current, &additions) {
                        Some(merged) => store
                            .edit(&id, json!({ "affectedResources": merged }))
                            .await
                            .map(Some),
                        None => Ok(None),
                    }
                }
            })
            .await?;

        if let Some(doc) = doc {
            self.record = parse(doc)?;
        }
        Ok(())
    }

    /// Applies several attributes in one write, retrying on conflict.
    pub async fn update(&mut self, update: JobUpdate) -> Result<(), JobError> {
        if update.is_empty() {
            return Ok(());
        }
        self.ensure_active()?;

        if let Some(next) = update.state {
            let current = self.record.state;
            if current != next && !current.can_transition_to(next) {
                return Err(JobError::InvalidTransition {
                    from: current,
                    to: next,
                });
            }
        }

        if let Err(e) = self.edit_retrying(update.to_document()).await {
            tracing::error!(job_id = %self.record.id, update = ?update, error = %e, "Failed to update job");
            return Err(e.into());
        }
        Ok(())
    }
}

fn parse(doc: Document) -> Result<JobRecord, StoreError> {
    Ok(serde_json::from_value(doc)?)
}

/// `current` plus the unseen `additions`, or `None` when nothing is new.
fn merge_refs(current: &[ResourceRef], additions: &[String]) -> Option<Vec<ResourceRef>> {
    let mut merged = current.to_vec();
    for href in additions {
        if !merged.iter().any(|r| &r.href == href) {
            merged.push(ResourceRef::new(href.clone()));
        }
    }
    (merged.len() > current.len()).then_some(merged)
}
