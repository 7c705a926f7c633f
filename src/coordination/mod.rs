//! Coordination primitives the engine relies on: a locking queue with
//! exclusive checkout and a leader election keyed by path.
//!
//! Both are traits so the backing service can be swapped. [`ZkCoordinator`]
//! provides them over a ZooKeeper ensemble shared by every engine process.
//! [`LocalCoordinator`] provides them in-process, with checkout and session
//! timeouts that behave like the service's session expiry.

pub mod election;
pub mod local;
pub mod zookeeper;

use async_trait::async_trait;
use thiserror::Error;

pub use election::{Candidate, ElectionPhase, LeaderElection, Leadership};
pub use local::{LocalCoordinator, LocalQueue};
pub use zookeeper::{ZkCoordinator, ZkQueue};

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Queue entry {0} is no longer checked out")]
    StaleEntry(u64),

    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),
}

/// Handle on a checked-out queue item. Pass it back to
/// [`LockingQueue::consume`] or [`LockingQueue::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    token: u64,
    payload: String,
}

impl QueueEntry {
    pub fn new(token: u64, payload: impl Into<String>) -> Self {
        Self {
            token,
            payload: payload.into(),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// The queued item (a job id).
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// FIFO queue shared by all consumers. A checked-out item is invisible to
/// other consumers until it is consumed or released, or until its consumer
/// stops renewing the checkout.
#[async_trait]
pub trait LockingQueue: Send + Sync {
    async fn put(&self, item: String) -> Result<(), CoordinationError>;

    /// Blocks until an item is available and checks it out to the caller.
    async fn get(&self) -> Result<QueueEntry, CoordinationError>;

    /// Removes a checked-out item for good.
    async fn consume(&self, entry: &QueueEntry) -> Result<(), CoordinationError>;

    /// Puts a checked-out item back for another consumer.
    async fn release(&self, entry: &QueueEntry) -> Result<(), CoordinationError>;

    /// Confirms the caller is still alive and holding `entry`. Returns
    /// [`CoordinationError::StaleEntry`] when the checkout was already lost.
    async fn renew(&self, entry: &QueueEntry) -> Result<(), CoordinationError>;
}
