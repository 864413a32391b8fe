//! Step records.
//!
//! One `StepRecord` exists per node occurrence within an automation instance.
//! The `(automation_id, previous_id, node_name)` triple is unique; the
//! `previous_id` links form a tree rooted at the step with no predecessor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::actor::InteractionRequirement;

/// Persisted record of one node occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub id: Uuid,
    pub automation_id: Uuid,
    /// Step this occurrence was reached from. `None` marks the graph root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Uuid>,
    /// Declaration name of the node this step is an occurrence of.
    pub node_name: String,
    /// Non-zero while an advancer holds the step.
    pub lock_count: i32,
    pub requires_interaction: bool,
    #[serde(default)]
    pub interaction: InteractionRequirement,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: Value,
}

impl StepRecord {
    /// A fresh, unlocked, unfinished step.
    pub fn new(automation_id: Uuid, previous_id: Option<Uuid>, node_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            automation_id,
            previous_id,
            node_name: node_name.into(),
            lock_count: 0,
            requires_interaction: false,
            interaction: InteractionRequirement::default(),
            created_at: Utc::now(),
            finished_at: None,
            message: String::new(),
            result: Value::Null,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_step_is_open_and_unlocked() {
        let step = StepRecord::new(Uuid::now_v7(), None, "start");
        assert!(!step.is_finished());
        assert!(!step.is_locked());
        assert_eq!(step.result, Value::Null);
        assert!(step.message.is_empty());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut step = StepRecord::new(Uuid::now_v7(), Some(Uuid::now_v7()), "approve");
        step.requires_interaction = true;
        step.interaction.group = Some("ops".into());
        step.result = serde_json::json!({"ok": true});

        let json = serde_json::to_string(&step).unwrap();
        let back: StepRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, step);
    }
}
