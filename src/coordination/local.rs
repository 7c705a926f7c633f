use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::config::CoordinationConfig;
use crate::coordination::{
    CoordinationError, LeaderElection, Leadership, LockingQueue, QueueEntry,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process coordination provider shared by every role in one process.
///
/// Queues and elections are created on first use and keyed by path.
pub struct LocalCoordinator {
    queues: DashMap<String, Arc<LocalQueue>>,
    elections: DashMap<String, Arc<ElectionSlot>>,
    config: CoordinationConfig,
}

impl LocalCoordinator {
    pub fn new(config: CoordinationConfig) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            elections: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// The queue at `path`.
    pub fn queue(&self, path: &str) -> Arc<LocalQueue> {
        self.queues
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(LocalQueue::new(path, self.config.checkout_timeout)))
            .clone()
    }

    /// Current holder of `election`, if any.
    pub fn leader(&self, election: &str) -> Option<String> {
        let slot = self.elections.get(election)?.clone();
        let holder = lock(&slot.holder);
        holder.as_ref().map(|h| h.participant.clone())
    }

    /// Expires every claim `participant` holds, as the service does when a
    /// session times out. Returns the number of elections it led.
    pub fn expire_session(&self, participant: &str) -> usize {
        let slots: Vec<Arc<ElectionSlot>> =
            self.elections.iter().map(|e| e.value().clone()).collect();

        slots
            .into_iter()
            .filter(|slot| slot.revoke(participant))
            .count()
    }

    fn slot(&self, election: &str) -> Arc<ElectionSlot> {
        self.elections
            .entry(election.to_string())
            .or_insert_with(|| Arc::new(ElectionSlot::default()))
            .clone()
    }
}

#[async_trait]
impl LeaderElection for LocalCoordinator {
    async fn campaign(
        &self,
        election: &str,
        participant: &str,
    ) -> Result<Box<dyn Leadership>, CoordinationError> {
        let slot = self.slot(election);

        loop {
            let vacated = slot.vacated.notified();
            tokio::pin!(vacated);
            vacated.as_mut().enable();

            if let Some(leadership) =
                ElectionSlot::try_acquire(&slot, participant, self.config.session_timeout)
            {
                return Ok(Box::new(leadership));
            }

            vacated.await;
        }
    }
}

#[derive(Default)]
struct ElectionSlot {
    holder: Mutex<Option<Holder>>,
    vacated: Notify,
    terms: Mutex<u64>,
}

struct Holder {
    participant: String,
    term: u64,
    revoked: watch::Sender<bool>,
}

impl ElectionSlot {
    fn try_acquire(
        slot: &Arc<Self>,
        participant: &str,
        session_timeout: Duration,
    ) -> Option<LocalLeadership> {
        let mut holder = lock(&slot.holder);
        if holder.is_some() {
            return None;
        }

        let term = {
            let mut terms = lock(&slot.terms);
            *terms += 1;
            *terms
        };
        let (revoked, watcher) = watch::channel(false);
        *holder = Some(Holder {
            participant: participant.to_string(),
            term,
            revoked,
        });

        Some(LocalLeadership {
            slot: slot.clone(),
            term,
            revoked: watcher,
            session_timeout,
            resigned: false,
        })
    }

    /// Frees the slot if `term` still holds it.
    fn release(&self, term: u64) {
        let mut holder = lock(&self.holder);
        if holder.as_ref().is_some_and(|h| h.term == term) {
            *holder = None;
            drop(holder);
            self.vacated.notify_waiters();
        }
    }

    fn revoke(&self, participant: &str) -> bool {
        let mut holder = lock(&self.holder);
        match holder.take() {
            Some(h) if h.participant == participant => {
                h.revoked.send_replace(true);
                drop(holder);
                self.vacated.notify_waiters();
                true
            }
            other => {
                *holder = other;
                false
            }
        }
    }
}

struct LocalLeadership {
    slot: Arc<ElectionSlot>,
    term: u64,
    revoked: watch::Receiver<bool>,
    session_timeout: Duration,
    resigned: bool,
}

#[async_trait]
impl Leadership for LocalLeadership {
    async fn lost(&mut self) {
        // A dropped sender means the claim was already released.
        let _ = self.revoked.wait_for(|revoked| *revoked).await;
    }

    async fn resign(mut self: Box<Self>) {
        self.resigned = true;
        self.slot.release(self.term);
    }
}

impl Drop for LocalLeadership {
    /// A holder that vanishes without resigning keeps the slot until its
    /// session would have timed out.
    fn drop(&mut self) {
        if self.resigned {
            return;
        }

        let slot = self.slot.clone();
        let term = self.term;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let timeout = self.session_timeout;
                handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    slot.release(term);
                });
            }
            Err(_) => slot.release(term),
        }
    }
}

/// In-process [`LockingQueue`].
///
/// A checkout expires when it goes `checkout_timeout` without a
/// [`LockingQueue::renew`]; the item goes back to the head of the queue and
/// its old entry becomes stale.
pub struct LocalQueue {
    path: String,
    state: Mutex<QueueState>,
    available: Notify,
    checkout_timeout: Duration,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    checked_out: HashMap<u64, Checkout>,
    next_token: u64,
}

struct Checkout {
    payload: String,
    deadline: Instant,
}

impl QueueState {
    /// Returns expired checkouts to the front of the queue, oldest first.
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let mut expired: Vec<u64> = self
            .checked_out
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        expired.sort_unstable();

        for token in expired.iter().rev() {
            if let Some(checkout) = self.checked_out.remove(token) {
                self.pending.push_front(checkout.payload);
            }
        }
        expired.len()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.checked_out.values().map(|c| c.deadline).min()
    }
}

impl LocalQueue {
    pub fn new(path: impl Into<String>, checkout_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            checkout_timeout,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Items waiting to be checked out.
    pub fn len(&self) -> usize {
        let mut state = lock(&self.state);
        state.reclaim_expired(Instant::now());
        state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently checked out.
    pub fn checked_out(&self) -> usize {
        let mut state = lock(&self.state);
        state.reclaim_expired(Instant::now());
        state.checked_out.len()
    }

    fn try_checkout(&self) -> Result<QueueEntry, Option<Instant>> {
        let now = Instant::now();
        let mut state = lock(&self.state);

        let reclaimed = state.reclaim_expired(now);
        if reclaimed > 0 {
            tracing::warn!(queue = %self.path, reclaimed, "Checkouts expired, items requeued");
        }

        let Some(payload) = state.pending.pop_front() else {
            return Err(state.next_deadline());
        };

        state.next_token += 1;
        let token = state.next_token;
        state.checked_out.insert(
            token,
            Checkout {
                payload: payload.clone(),
                deadline: now + self.checkout_timeout,
            },
        );
        if !state.pending.is_empty() {
            self.available.notify_one();
        }

        Ok(QueueEntry::new(token, payload))
    }
}

#[async_trait]
impl LockingQueue for LocalQueue {
    async fn put(&self, item: String) -> Result<(), CoordinationError> {
        lock(&self.state).pending.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    async fn get(&self) -> Result<QueueEntry, CoordinationError> {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            match self.try_checkout() {
                Ok(entry) => return Ok(entry),
                Err(Some(deadline)) => {
                    tokio::select! {
                        _ = &mut available => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Err(None) => available.await,
            }
        }
    }

    async fn consume(&self, entry: &QueueEntry) -> Result<(), CoordinationError> {
        lock(&self.state)
            .checked_out
            .remove(&entry.token())
            .map(|_| ())
            .ok_or(CoordinationError::StaleEntry(entry.token()))
    }

    async fn renew(&self, entry: &QueueEntry) -> Result<(), CoordinationError> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        state.reclaim_expired(now);
        let checkout = state
            .checked_out
            .get_mut(&entry.token())
            .ok_or(CoordinationError::StaleEntry(entry.token()))?;
        checkout.deadline = now + self.checkout_timeout;
        Ok(())
    }

    async fn release(&self, entry: &QueueEntry) -> Result<(), CoordinationError> {
        {
            let mut state = lock(&self.state);
            let checkout = state
                .checked_out
                .remove(&entry.token())
                .ok_or(CoordinationError::StaleEntry(entry.token()))?;
            state.pending.push_front(checkout.payload);
        }
        self.available.notify_one();
        Ok(())
    }
}
