use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::action::{Action, ExecutorContext};
use crate::job::{Job, JobState, JOB_COLLECTION};
use crate::store::memory::timestamp;
use crate::store::{Filter, SearchQuery};

pub const NAME: &str = "cleanup_jobs";

/// Return code reported by a cleanup run.
pub const CLEANUP_RETURN_CODE: i64 = 10000;

const PAGE_SIZE: u64 = 100;

/// Deletes finished jobs older than the retention window.
pub struct JobsCleanup {
    ctx: ExecutorContext,
    job: Job,
    retention: chrono::Duration,
}

impl JobsCleanup {
    pub const TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(ctx: ExecutorContext, job: Job) -> Self {
        Self {
            ctx,
            job,
            retention: chrono::Duration::days(7),
        }
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    fn filter(&self) -> Filter {
        let cutoff = timestamp(Utc::now() - self.retention);
        Filter::eq("state", JobState::Success.as_str())
            .or(Filter::eq("state", JobState::Failed.as_str()))
            .and(Filter::lt("created", cutoff))
    }
}

#[async_trait]
impl Action for JobsCleanup {
    fn timeout(&self) -> Duration {
        Self::TIMEOUT
    }

    async fn do_work(&mut self) -> anyhow::Result<i64> {
        tracing::info!(job_id = %self.job.id(), "Cleanup of completed jobs started");

        let store = self.ctx.store().clone();
        let query = SearchQuery::new().filter(self.filter()).first(1).last(PAGE_SIZE);
        let mut removed = 0u64;
        let mut failures = 0u64;

        // Deleted jobs drop out of the results, so the first page is always next.
        loop {
            let page = store.search(JOB_COLLECTION, &query).await?;
            if page.resources.is_empty() {
                break;
            }

            let mut deleted_on_page = 0;
            for doc in &page.resources {
                let Some(id) = doc.get("id").and_then(Value::as_str) else {
                    failures += 1;
                    continue;
                };
                match store.delete(id).await {
                    Ok(()) => deleted_on_page += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!(job_id = %id, error = %e, "Failed to delete job");
                        failures += 1;
                    }
                }
            }

            removed += deleted_on_page;
            if deleted_on_page == 0 {
                break;
            }
        }

        let message = if failures > 0 {
            let msg = format!(
                "Cleanup of completed jobs have some failures: removed {} jobs, {} failures.",
                removed, failures
            );
            tracing::warn!(job_id = %self.job.id(), removed, failures, "Cleanup finished with failures");
            msg
        } else {
            tracing::info!(job_id = %self.job.id(), removed, "Cleanup of completed jobs finished");
            format!("Cleanup of completed jobs finished. Removed {} jobs.", removed)
        };
        self.job.set_status_message(message).await?;

        Ok(CLEANUP_RETURN_CODE)
    }
}
