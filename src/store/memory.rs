use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::coordination::LockingQueue;
use crate::job::{JobState, JOB_COLLECTION};
use crate::store::{
    resource_name, Document, ResourceStore, SearchQuery, SearchResults, StoreError,
};

/// Formats a timestamp the way stored documents carry it.
pub fn timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// In-process [`ResourceStore`].
///
/// When built with [`MemoryStore::with_queue`], every document created in the
/// job collection has its id put on the queue, the way the remote API hands
/// new jobs to executors. New jobs start out QUEUED either way.
#[derive(Default)]
pub struct MemoryStore {
    docs: DashMap<String, Document>,
    queue: Option<Arc<dyn LockingQueue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(queue: Arc<dyn LockingQueue>) -> Self {
        Self {
            docs: DashMap::new(),
            queue: Some(queue),
        }
    }

    /// Stores `doc` under `id` as-is (apart from the `id` field), replacing
    /// any existing document. Intended for seeding fixtures.
    pub fn insert(&self, id: impl Into<String>, mut doc: Document) {
        let id = id.into();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.clone()));
        }
        self.docs.insert(id, doc);
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Ids of every document in `collection`.
    pub fn ids(&self, collection: &str) -> Vec<String> {
        let prefix = format!("{}/", resource_name(collection));
        let mut ids: Vec<String> = self
            .docs
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

fn as_object(id: &str, doc: Document) -> Result<serde_json::Map<String, Value>, StoreError> {
    match doc {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Api {
            status: 400,
            message: format!("document for {} must be an object, got {}", id, other),
        }),
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn create(&self, collection: &str, doc: Document) -> Result<String, StoreError> {
        let id = format!("{}/{}", resource_name(collection), Uuid::new_v4());
        let mut fields = as_object(&id, doc)?;
        let now = Value::String(timestamp(Utc::now()));
        fields.insert("id".to_string(), Value::String(id.clone()));
        fields.entry("created").or_insert_with(|| now.clone());
        fields.insert("updated".to_string(), now);
        if collection == JOB_COLLECTION {
            fields
                .entry("state")
                .or_insert_with(|| Value::String(JobState::Queued.as_str().to_string()));
            fields.entry("progress").or_insert_with(|| Value::from(0));
        }
        self.docs.insert(id.clone(), Value::Object(fields));

        if collection == JOB_COLLECTION {
            if let Some(queue) = &self.queue {
                if let Err(e) = queue.put(id.clone()).await {
                    self.docs.remove(&id);
                    return Err(StoreError::Unavailable(format!(
                        "failed to enqueue {}: {}",
                        id, e
                    )));
                }
            }
        }

        tracing::debug!(id = %id, "Resource created");
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        self.docs
            .get(id)
            .map(|doc| doc.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn edit(&self, id: &str, partial: Document) -> Result<Document, StoreError> {
        let changes = as_object(id, partial)?;
        let mut entry = self
            .docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(fields) = entry.value_mut().as_object_mut() {
            for (key, value) in changes {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
            fields.insert("updated".to_string(), Value::String(timestamp(Utc::now())));
        }

        Ok(entry.value().clone())
    }

    async fn search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<SearchResults, StoreError> {
        let prefix = format!("{}/", resource_name(collection));
        let mut matches: Vec<Document> = self
            .docs
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .filter(|entry| {
                query
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.matches(entry.value()))
            })
            .map(|entry| entry.value().clone())
            .collect();

        matches.sort_by(|a, b| {
            let key = |doc: &Document| {
                (
                    doc.get("created").and_then(Value::as_str).unwrap_or("").to_string(),
                    doc.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                )
            };
            key(a).cmp(&key(b))
        });

        let count = matches.len() as u64;
        let first = query.first.unwrap_or(1).max(1);
        let last = query.last.unwrap_or(count);
        let resources = if last < first {
            Vec::new()
        } else {
            matches
                .into_iter()
                .skip((first - 1) as usize)
                .take((last - first + 1) as usize)
                .collect()
        };

        Ok(SearchResults { count, resources })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.docs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
