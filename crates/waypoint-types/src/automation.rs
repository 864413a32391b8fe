//! Automation instance records.
//!
//! An `AutomationRecord` is one running, data-bound execution of a workflow
//! definition. Its `data` map is the only state user actions may read and
//! write; the engine persists it after every step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Free-form key/value payload carried by every automation instance.
pub type AutomationData = Map<String, Value>;

/// Persisted state of one automation instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationRecord {
    /// UUIDv7 assigned on creation.
    pub id: Uuid,
    /// Name of the workflow definition this instance runs.
    pub automation_class: String,
    /// Set once a terminal node runs (or the instance fails hard). Never cleared.
    pub finished: bool,
    /// User payload.
    #[serde(default)]
    pub data: AutomationData,
    /// Earliest time at which a suspended branch wants to be resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_until: Option<DateTime<Utc>>,
    /// Stable hash of `(automation_class, id)` for external lookups.
    pub unique_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRecord {
    /// Build a fresh, unfinished instance record.
    pub fn new(automation_class: impl Into<String>, data: AutomationData) -> Self {
        let id = Uuid::now_v7();
        let automation_class = automation_class.into();
        let unique_key = unique_key(&automation_class, &id);
        let now = Utc::now();
        Self {
            id,
            automation_class,
            finished: false,
            data,
            paused_until: None,
            unique_key,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the driver should advance this instance at `now`.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        !self.finished && self.paused_until.is_none_or(|t| t <= now)
    }
}

/// Derive the lookup key for an instance: hex SHA-256 of `"{class}:{id}"`.
pub fn unique_key(automation_class: &str, id: &Uuid) -> String {
    format!(
        "{:x}",
        Sha256::digest(format!("{automation_class}:{id}").as_bytes())
    )
}
