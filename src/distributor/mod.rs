//! Producer side: one leader per job type turns a generator stream into jobs.

pub mod generators;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::DistributorConfig;
use crate::coordination::{Candidate, ElectionPhase, LeaderElection, LockingQueue};
use crate::error::EngineError;
use crate::job::{Job, JobUpdate, NewJob, JOB_COLLECTION};
use crate::store::ResourceStore;

pub use generators::{PeriodicGenerator, TargetSweepGenerator};

pub type JobStream = Pin<Box<dyn Stream<Item = NewJob> + Send>>;

/// Source of job payloads for one job type.
///
/// Each call to `generate` starts a fresh, coherent stream, so a newly elected
/// distributor can begin from scratch. Streams may pace themselves by sleeping
/// and are responsible for not yielding a job that is already queued.
pub trait JobGenerator: Send + Sync {
    fn generate(&self, store: Arc<dyn ResourceStore>) -> JobStream;
}

/// Generator for a built-in job type.
pub fn builtin_generator(job_type: &str) -> Result<Arc<dyn JobGenerator>, EngineError> {
    match job_type {
        crate::action::dummy::NAME => Ok(Arc::new(PeriodicGenerator::new(
            crate::action::dummy::NAME,
            "dummy",
            Duration::from_secs(15),
        ))),
        crate::action::cleanup::NAME => Ok(Arc::new(PeriodicGenerator::new(
            crate::action::cleanup::NAME,
            JOB_COLLECTION,
            Duration::from_secs(24 * 60 * 60),
        ))),
        other => Err(EngineError::UnknownJobType(other.to_string())),
    }
}

pub struct Distributor {
    config: DistributorConfig,
    generator: Arc<dyn JobGenerator>,
    store: Arc<dyn ResourceStore>,
    candidate: Candidate,
    queue: Option<Arc<dyn LockingQueue>>,
}

impl Distributor {
    pub fn new(
        config: DistributorConfig,
        name: &str,
        generator: Arc<dyn JobGenerator>,
        store: Arc<dyn ResourceStore>,
        election: Arc<dyn LeaderElection>,
    ) -> Self {
        let candidate = Candidate::new(election, config.election_path(), name);
        Self {
            config,
            generator,
            store,
            candidate,
            queue: None,
        }
    }

    /// Also puts each created job id on `queue`, for stores that do not
    /// enqueue new jobs themselves.
    pub fn with_queue(mut self, queue: Arc<dyn LockingQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn job_type(&self) -> &str {
        &self.config.job_type
    }

    pub fn name(&self) -> &str {
        self.candidate.participant()
    }

    pub fn phase(&self) -> ElectionPhase {
        self.candidate.phase()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionPhase> {
        self.candidate.subscribe()
    }

    /// Competes for leadership of this job type until `shutdown` fires,
    /// publishing jobs whenever elected.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(job_type = %self.config.job_type, name = %self.name(), "Distributor started");

        while !shutdown.is_cancelled() {
            let elected = self
                .candidate
                .run_as_leader(self.generate_and_publish(), &shutdown)
                .await;

            match elected {
                Ok(()) if shutdown.is_cancelled() => break,
                Ok(()) => {
                    tracing::info!(job_type = %self.config.job_type, "Re-entering election");
                }
                Err(e) => {
                    tracing::error!(job_type = %self.config.job_type, error = %e, "Election failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.restart_delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!(job_type = %self.config.job_type, name = %self.name(), "Distributor stopped");
    }

    /// Runs while leading. Restarts the generator whenever its stream ends.
    async fn generate_and_publish(&self) {
        loop {
            let mut jobs = self.generator.generate(self.store.clone());
            while let Some(job) = jobs.next().await {
                self.publish(&job).await;
            }

            tracing::debug!(job_type = %self.config.job_type, "Generator exhausted, restarting");
            tokio::time::sleep(self.config.restart_delay).await;
        }
    }

    /// Creates one job. Failures are logged and followed by a short pause;
    /// the item is not retried.
    pub async fn publish(&self, job: &NewJob) -> Option<String> {
        let id = match self.create(job).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(job_type = %self.config.job_type, job = %job, error = %e, "Failed to distribute job");
                tokio::time::sleep(self.config.publish_failure_delay).await;
                return None;
            }
        };

        tracing::info!(job_type = %self.config.job_type, job_id = %id, job = %job, "Distributed job");
        Some(id)
    }

    async fn create(&self, job: &NewJob) -> Result<String, EngineError> {
        let doc = serde_json::to_value(job).map_err(crate::store::StoreError::from)?;
        let id = self.store.create(JOB_COLLECTION, doc).await?;

        if let Some(queue) = &self.queue {
            if let Err(e) = queue.put(id.clone()).await {
                self.discard_unqueued(&id).await;
                return Err(e.into());
            }
        }
        Ok(id)
    }

    /// A created job that never reached the queue would sit QUEUED forever
    /// and block its target. Delete it, or fail it if it cannot be deleted.
    async fn discard_unqueued(&self, id: &str) {
        let Err(e) = self.store.delete(id).await else {
            tracing::warn!(job_id = %id, "Removed job that could not be queued");
            return;
        };
        tracing::warn!(job_id = %id, error = %e, "Failed to remove unqueued job, marking it failed");

        let failed = JobUpdate::failed(format!("Failed to queue {}", id));
        let result = match Job::load(self.store.clone(), id).await {
            Ok(mut job) => job.update(failed).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::error!(job_id = %id, error = %e, "Unqueued job left behind");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_generators() {
        assert!(builtin_generator("dummy_test_action").is_ok());
        assert!(builtin_generator("cleanup_jobs").is_ok());
        assert!(matches!(
            builtin_generator("collect_quotas"),
            Err(EngineError::UnknownJobType(t)) if t == "collect_quotas"
        ));
    }
}
