use std::future::Future;
use std::time::Duration;

use crate::store::StoreError;

/// Bounded retry for edits rejected with [`StoreError::Conflict`].
///
/// The operation is re-run (it is expected to re-read and reapply its change)
/// with exponential backoff and jitter until it succeeds, fails with any other
/// error, or `max_attempts` is reached, in which case
/// [`StoreError::RetriesExhausted`] is returned.
#[derive(Debug, Clone)]
pub struct ConflictRetry {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl ConflictRetry {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` with the 1-based attempt number until it stops conflicting.
    pub async fn run<F, Fut, T>(&self, id: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_attempts.max(1);

        for attempt in 1..=attempts {
            match op(attempt).await {
                Err(StoreError::Conflict(_)) if attempt < attempts => {
                    let jitter = Duration::from_millis(rand::random::<u64>() % 25);
                    let delay = self.delay_for_attempt(attempt) + jitter;
                    tracing::debug!(id, attempt, delay_ms = delay.as_millis() as u64, "Edit conflicted, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(StoreError::Conflict(_)) => break,
                other => return other,
            }
        }

        tracing::warn!(id, attempts, "Edit kept conflicting, giving up");
        Err(StoreError::RetriesExhausted {
            id: id.to_string(),
            attempts,
        })
    }
}
