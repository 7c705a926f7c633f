use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::state::JobState;

/// Reference to another resource in the store (`{"href": "credential/…"}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub href: String,
}

impl ResourceRef {
    pub fn new(href: impl Into<String>) -> Self {
        Self { href: href.into() }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.href)
    }
}

/// Payload a distributor submits to create a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub action: String,
    pub target_resource: ResourceRef,
}

impl NewJob {
    pub fn new(action: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target_resource: ResourceRef::new(target),
        }
    }
}

impl std::fmt::Display for NewJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {}", self.action, self.target_resource)
    }
}

/// Local projection of a job document. Fields missing from the document take
/// the values the store assigns to a fresh job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobRecord {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) action: Option<String>,
    #[serde(default)]
    pub(crate) target_resource: Option<ResourceRef>,
    #[serde(default)]
    pub(crate) state: JobState,
    #[serde(default)]
    pub(crate) progress: u8,
    #[serde(default)]
    pub(crate) status_message: Option<String>,
    #[serde(default)]
    pub(crate) return_code: Option<i64>,
    #[serde(default)]
    pub(crate) affected_resources: Vec<ResourceRef>,
    #[serde(default)]
    pub(crate) created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub(crate) updated: Option<DateTime<Utc>>,
}
