//! Client side of the remote resource API that persists jobs and the
//! entities they act on.
//!
//! - [`ResourceStore`]: the create/get/edit/search/delete contract
//! - [`HttpResourceStore`]: REST client with a cookie session
//! - [`MemoryStore`]: in-process store, optionally enqueueing created jobs
//! - [`ConflictRetry`]: bounded re-read-and-reapply loop for `409` edits

pub mod filter;
pub mod http;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use thiserror::Error;

pub use filter::Filter;
pub use http::HttpResourceStore;
pub use memory::MemoryStore;
pub use retry::ConflictRetry;

/// A resource document as exchanged with the store (a JSON object).
pub type Document = serde_json::Value;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflicting edit on {0}")]
    Conflict(String),

    #[error("Gave up editing {id} after {attempts} conflicting attempts")]
    RetriesExhausted { id: String, attempts: u32 },

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Paging and filtering for [`ResourceStore::search`]. `first` and `last`
/// are 1-based and inclusive; `last = Some(0)` asks for the count only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub filter: Option<Filter>,
    pub first: Option<u64>,
    pub last: Option<u64>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn first(mut self, first: u64) -> Self {
        self.first = Some(first);
        self
    }

    pub fn last(mut self, last: u64) -> Self {
        self.last = Some(last);
        self
    }

    pub fn count_only(self) -> Self {
        self.last(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    /// Total number of matches, independent of paging.
    pub count: u64,
    pub resources: Vec<Document>,
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Creates a resource in `collection` and returns its id.
    async fn create(&self, collection: &str, doc: Document) -> Result<String, StoreError>;

    async fn get(&self, id: &str) -> Result<Document, StoreError>;

    /// Merges `partial` into the resource and returns the stored document.
    /// Fails with [`StoreError::Conflict`] when a concurrent write won.
    async fn edit(&self, id: &str, partial: Document) -> Result<Document, StoreError>;

    async fn search(&self, collection: &str, query: &SearchQuery)
        -> Result<SearchResults, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Resource-name prefix of ids in a collection (`jobs` -> `job`).
pub fn resource_name(collection: &str) -> &str {
    collection.strip_suffix('s').unwrap_or(collection)
}
