//! Consumer side: a pool of workers taking jobs off the locking queue and
//! running their actions under a deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::action::{ActionRegistry, ExecutorContext};
use crate::config::ExecutorConfig;
use crate::coordination::{LockingQueue, QueueEntry};
use crate::job::{Job, JobError, JobState, JobUpdate};
use crate::store::ResourceStore;

/// Why a delivered job was dropped without running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// The job document no longer exists.
    Missing,
    /// The job had already reached this terminal state.
    Finished(JobState),
}

/// Result of one worker iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Discarded { job_id: String, reason: DiscardReason },
    /// A stop request was honored; the action never ran.
    Stopped { job_id: String },
    Succeeded { job_id: String, return_code: i64 },
    Failed { job_id: String, message: String },
    TimedOut { job_id: String, message: String },
    NotImplemented { job_id: String, action: String },
    /// Bookkeeping failed before the action started; the entry was released.
    Aborted { job_id: String, message: String },
}

impl Outcome {
    pub fn job_id(&self) -> &str {
        match self {
            Outcome::Discarded { job_id, .. }
            | Outcome::Stopped { job_id }
            | Outcome::Succeeded { job_id, .. }
            | Outcome::Failed { job_id, .. }
            | Outcome::TimedOut { job_id, .. }
            | Outcome::NotImplemented { job_id, .. }
            | Outcome::Aborted { job_id, .. } => job_id,
        }
    }

    /// Outcomes after which a worker pauses before its next checkout.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::Failed { .. } | Outcome::TimedOut { .. } | Outcome::Aborted { .. }
        )
    }
}

pub struct Executor {
    config: ExecutorConfig,
    name: String,
    queue: Arc<dyn LockingQueue>,
    store: Arc<dyn ResourceStore>,
    registry: Arc<ActionRegistry>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        name: impl Into<String>,
        queue: Arc<dyn LockingQueue>,
        store: Arc<dyn ResourceStore>,
        registry: Arc<ActionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            name: name.into(),
            queue,
            store,
            registry,
        })
    }

    pub fn worker_name(&self, index: usize) -> String {
        format!("{}-worker-{}", self.name, index)
    }

    /// Runs `worker_count` workers until `shutdown` fires. Each worker
    /// finishes the job it holds before stopping.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            name = %self.name,
            workers = self.config.worker_count,
            actions = ?self.registry.names(),
            "Executor started"
        );

        let mut workers = JoinSet::new();
        for index in 1..=self.config.worker_count {
            let executor = self.clone();
            let worker = self.worker_name(index);
            let shutdown = shutdown.clone();
            let span = tracing::info_span!("worker", name = %worker);
            workers.spawn(async move { executor.worker_loop(worker, shutdown).await }.instrument(span));
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(name = %self.name, error = %e, "Worker task ended abnormally");
            }
        }

        tracing::info!(name = %self.name, "Executor stopped");
    }

    async fn worker_loop(&self, worker: String, shutdown: CancellationToken) {
        tracing::info!("Worker started");

        loop {
            let checkout = tokio::select! {
                _ = shutdown.cancelled() => break,
                checkout = self.queue.get() => checkout,
            };

            let pause = match checkout {
                Ok(entry) => self.process(&worker, entry).await.is_failure(),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to check out a job");
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.failure_pause) => {}
                }
            }
        }

        tracing::info!("Worker stopped");
    }

    /// Handles one checked-out entry from start to finish.
    pub async fn process(&self, worker: &str, entry: QueueEntry) -> Outcome {
        let job_id = entry.payload().to_string();

        let mut job = match Job::load(self.store.clone(), &job_id).await {
            Ok(job) => job,
            Err(JobError::Missing(_)) => {
                tracing::warn!(job_id = %job_id, "Job no longer exists, discarding");
                self.consume(&entry).await;
                return Outcome::Discarded {
                    job_id,
                    reason: DiscardReason::Missing,
                };
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load job, releasing");
                self.release(&entry).await;
                return Outcome::Aborted {
                    job_id,
                    message: e.to_string(),
                };
            }
        };

        tracing::info!(job_id = %job_id, action = ?job.action(), state = %job.state(), "Got new job");

        match job.state() {
            state if state.is_terminal() => {
                tracing::info!(job_id = %job_id, state = %state, "Job already finished, discarding");
                self.consume(&entry).await;
                return Outcome::Discarded {
                    job_id,
                    reason: DiscardReason::Finished(state),
                };
            }
            JobState::Stopping => {
                self.consume(&entry).await;
                if let Err(e) = job.update(JobUpdate::stopped()).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to mark job stopped");
                }
                tracing::info!(job_id = %job_id, "Job stopped before running");
                return Outcome::Stopped { job_id };
            }
            _ => {}
        }

        if let Err(e) = job.set_state(JobState::Running).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job running, releasing");
            self.release(&entry).await;
            return Outcome::Aborted {
                job_id,
                message: e.to_string(),
            };
        }

        let action_name = job.action().unwrap_or_default().to_string();
        let Some(factory) = self.registry.resolve(&action_name) else {
            tracing::error!(job_id = %job_id, action = %action_name, "Action not implemented");
            self.consume(&entry).await;
            let message = format!("Action \"{}\" is not implemented", action_name);
            self.finish(&mut job, JobUpdate::failed(message)).await;
            return Outcome::NotImplemented {
                job_id,
                action: action_name,
            };
        };

        // Cancelled once the executor stops waiting; the action's job handle
        // refuses writes from then on.
        let released = CancellationToken::new();
        let ctx = ExecutorContext::new(self.store.clone(), worker).with_release(released.clone());
        let mut action = factory(ctx, job.clone().bound_to(released.clone()));
        let deadline = action.timeout();

        tracing::debug!(job_id = %job_id, action = %action_name, timeout_ms = deadline.as_millis() as u64, "Processing job");

        // On timeout the task is detached, not aborted; the action may keep running.
        let handle = tokio::spawn(async move { action.do_work().await });
        let work = tokio::time::timeout(deadline, handle);
        tokio::pin!(work);

        // Keep the checkout alive for as long as the action runs.
        let period = self.config.lease_renewal.max(Duration::from_millis(1));
        let mut renewal = tokio::time::interval_at(Instant::now() + period, period);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = renewal.tick() => self.renew(&entry).await,
            }
        };

        released.cancel();
        self.consume(&entry).await;

        match result {
            Ok(Ok(Ok(return_code))) => {
                self.finish(&mut job, JobUpdate::success(return_code)).await;
                tracing::info!(job_id = %job_id, return_code, "Successfully finished job");
                Outcome::Succeeded { job_id, return_code }
            }
            Ok(Ok(Err(e))) => {
                let message = format!("Failed to process {}: {:#}", job_id, e);
                tracing::error!(job_id = %job_id, error = %e, "Processing failed");
                self.finish(&mut job, JobUpdate::failed(message.clone())).await;
                Outcome::Failed { job_id, message }
            }
            Ok(Err(join_error)) => {
                let message = format!(
                    "Failed to process {}: action panicked: {}",
                    job_id,
                    panic_message(join_error)
                );
                tracing::error!(job_id = %job_id, message = %message, "Processing failed");
                self.finish(&mut job, JobUpdate::failed(message.clone())).await;
                Outcome::Failed { job_id, message }
            }
            Err(_) => {
                let message = timeout_message(&job_id, deadline);
                tracing::error!(job_id = %job_id, timeout_ms = deadline.as_millis() as u64, "Timeout during execution");
                self.finish(&mut job, JobUpdate::failed(message.clone())).await;
                Outcome::TimedOut { job_id, message }
            }
        }
    }

    /// Writes the final state, unless the job reached a terminal state
    /// through some other writer in the meantime.
    async fn finish(&self, job: &mut Job, update: JobUpdate) {
        if let Err(e) = job.refresh().await {
            tracing::warn!(job_id = %job.id(), error = %e, "Failed to refresh job before final update");
        }
        if job.is_terminal() {
            tracing::warn!(job_id = %job.id(), state = %job.state(), "Job already finished, keeping its state");
            return;
        }
        if let Err(e) = job.update(update).await {
            tracing::error!(job_id = %job.id(), error = %e, "Failed to record job result");
        }
    }

    async fn consume(&self, entry: &QueueEntry) {
        if let Err(e) = self.queue.consume(entry).await {
            tracing::error!(job_id = %entry.payload(), error = %e, "Failed to consume queue entry");
        }
    }

    async fn renew(&self, entry: &QueueEntry) {
        if let Err(e) = self.queue.renew(entry).await {
            tracing::warn!(job_id = %entry.payload(), error = %e, "Failed to renew queue entry");
        }
    }

    async fn release(&self, entry: &QueueEntry) {
        if let Err(e) = self.queue.release(entry).await {
            tracing::error!(job_id = %entry.payload(), error = %e, "Failed to release queue entry");
        }
    }
}

fn timeout_message(job_id: &str, deadline: Duration) -> String {
    format!(
        "Failed to process {}: Timeout during execution after {:.1}s",
        job_id,
        deadline.as_secs_f64()
    )
}

fn panic_message(error: tokio::task::JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(error) => error.to_string(),
    }
}
