use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use serde_json::Value;
use tokio::time::Instant;

use crate::distributor::{JobGenerator, JobStream};
use crate::job::{JobState, NewJob, JOB_COLLECTION};
use crate::store::{Filter, ResourceStore, SearchQuery};

/// Yields the same job right away and then once every `interval`.
#[derive(Debug, Clone)]
pub struct PeriodicGenerator {
    job: NewJob,
    interval: Duration,
}

impl PeriodicGenerator {
    pub fn new(action: impl Into<String>, target: impl Into<String>, interval: Duration) -> Self {
        Self {
            job: NewJob::new(action, target),
            interval,
        }
    }
}

impl JobGenerator for PeriodicGenerator {
    fn generate(&self, _store: Arc<dyn ResourceStore>) -> JobStream {
        let job = self.job.clone();
        let interval = self.interval;

        Box::pin(stream::unfold(true, move |first| {
            let job = job.clone();
            async move {
                if !first {
                    tokio::time::sleep(interval).await;
                }
                Some((job, false))
            }
        }))
    }
}

/// One job per resource found in `collection`, swept every `interval`.
///
/// Targets that already have a QUEUED job for the same action are skipped.
/// Yields within a sweep are spread over part of the interval and the next
/// sweep starts once the interval is up.
#[derive(Debug, Clone)]
pub struct TargetSweepGenerator {
    action: String,
    collection: String,
    filter: Option<Filter>,
    interval: Duration,
    page_size: u64,
}

impl TargetSweepGenerator {
    pub fn new(action: impl Into<String>, collection: impl Into<String>, interval: Duration) -> Self {
        Self {
            action: action.into(),
            collection: collection.into(),
            filter: None,
            interval,
            page_size: 100,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

impl JobGenerator for TargetSweepGenerator {
    fn generate(&self, store: Arc<dyn ResourceStore>) -> JobStream {
        let sweep = Arc::new(Sweep {
            config: self.clone(),
            store,
        });

        Box::pin(stream::unfold(SweepState::default(), move |mut state| {
            let sweep = sweep.clone();
            async move {
                let job = sweep.next(&mut state).await;
                Some((job, state))
            }
        }))
    }
}

struct Sweep {
    config: TargetSweepGenerator,
    store: Arc<dyn ResourceStore>,
}

#[derive(Default)]
struct SweepState {
    targets: VecDeque<String>,
    started: Option<Instant>,
    spacing: Duration,
    yielded: bool,
}

impl Sweep {
    /// Waits for the next target that needs a job.
    async fn next(&self, state: &mut SweepState) -> NewJob {
        loop {
            if state.yielded {
                state.yielded = false;
                tokio::time::sleep(state.spacing).await;
            }

            let Some(target) = state.targets.pop_front() else {
                self.start_cycle(state).await;
                continue;
            };

            match self.has_queued_job(&target).await {
                Ok(true) => {
                    tracing::debug!(action = %self.config.action, target = %target, "Job already queued, skipping target");
                }
                Ok(false) => {
                    state.yielded = true;
                    return NewJob::new(self.config.action.clone(), target);
                }
                Err(e) => {
                    tracing::warn!(action = %self.config.action, target = %target, error = %e, "Failed to check for queued jobs, skipping target");
                }
            }
        }
    }

    /// Sleeps out the rest of the previous cycle, then loads the targets.
    async fn start_cycle(&self, state: &mut SweepState) {
        if let Some(started) = state.started {
            tokio::time::sleep_until(started + self.config.interval).await;
        }
        state.started = Some(Instant::now());

        match self.targets().await {
            Ok(targets) => {
                tracing::debug!(collection = %self.config.collection, count = targets.len(), "Sweeping targets");
                state.spacing = target_spacing(self.config.interval, targets.len());
                state.targets = targets.into();
            }
            Err(e) => {
                tracing::warn!(collection = %self.config.collection, error = %e, "Failed to list targets");
            }
        }
    }

    async fn targets(&self) -> Result<Vec<String>, crate::store::StoreError> {
        let mut ids = Vec::new();
        let mut first = 1;

        loop {
            let mut query = SearchQuery::new()
                .first(first)
                .last(first + self.config.page_size - 1);
            if let Some(filter) = &self.config.filter {
                query = query.filter(filter.clone());
            }

            let page = self.store.search(&self.config.collection, &query).await?;
            let fetched = page.resources.len() as u64;
            ids.extend(
                page.resources
                    .iter()
                    .filter_map(|doc| doc.get("id").and_then(Value::as_str))
                    .map(str::to_string),
            );

            first += fetched;
            if fetched == 0 || first > page.count {
                return Ok(ids);
            }
        }
    }

    async fn has_queued_job(&self, target: &str) -> Result<bool, crate::store::StoreError> {
        let filter = Filter::eq("action", self.config.action.as_str())
            .and(Filter::eq("targetResource/href", target))
            .and(Filter::eq("state", JobState::Queued.as_str()));
        let found = self
            .store
            .search(JOB_COLLECTION, &SearchQuery::new().filter(filter).count_only())
            .await?;
        Ok(found.count > 0)
    }
}

/// Pause between two targets, so one sweep spreads over 60% of `interval`.
fn target_spacing(interval: Duration, targets: usize) -> Duration {
    if targets == 0 {
        return Duration::ZERO;
    }
    interval.mul_f64(0.6).div_f64(targets as f64)
}
