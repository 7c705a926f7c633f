use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::action::Action;
use crate::job::Job;

pub const NAME: &str = "dummy_test_action";

/// Exercises the pipeline: waits a random while, reports halfway progress and
/// returns 0.
pub struct DummyTestAction {
    job: Job,
    min_wait: Duration,
    max_wait: Duration,
}

impl DummyTestAction {
    pub const TIMEOUT: Duration = Duration::from_secs(15);

    pub fn new(job: Job) -> Self {
        Self {
            job,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
        }
    }

    pub fn with_wait(mut self, min: Duration, max: Duration) -> Self {
        self.min_wait = min;
        self.max_wait = max.max(min);
        self
    }

    fn pick_wait(&self) -> Duration {
        let min = self.min_wait.as_millis() as u64;
        let max = self.max_wait.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[async_trait]
impl Action for DummyTestAction {
    fn timeout(&self) -> Duration {
        Self::TIMEOUT
    }

    async fn do_work(&mut self) -> anyhow::Result<i64> {
        let wait = self.pick_wait();
        tracing::info!(job_id = %self.job.id(), wait_ms = wait.as_millis() as u64, "Working hard");

        tokio::time::sleep(wait / 2).await;
        self.job.set_progress(50).await?;
        tokio::time::sleep(wait - wait / 2).await;

        Ok(0)
    }
}
