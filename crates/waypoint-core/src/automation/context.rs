//! Contexts handed to user callables.
//!
//! - [`DataHandle`] -- shared, mutable view of an instance's data payload
//! - [`StepContext`] -- input to actions run by Execute and If nodes
//! - [`GuardContext`] -- read-only input to conditions and wake-time functions
//! - [`MessageContext`] -- input to message receivers

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;
use waypoint_types::automation::AutomationData;
use waypoint_types::step::StepRecord;

// ---------------------------------------------------------------------------
// DataHandle
// ---------------------------------------------------------------------------

/// Shared handle on an automation's data payload.
///
/// Cloning shares the underlying map. Mutations are persisted by the engine
/// after each step (or explicitly via `Automation::save`).
#[derive(Clone, Default)]
pub struct DataHandle(Arc<RwLock<AutomationData>>);

impl DataHandle {
    pub fn new(data: AutomationData) -> Self {
        Self(Arc::new(RwLock::new(data)))
    }

    // A panicking action must not wedge the instance, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, AutomationData> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AutomationData> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().remove(key)
    }

    /// Integer value of `key`, if present and integral.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.read().get(key).and_then(Value::as_i64)
    }

    /// Run `f` with exclusive access to the map.
    pub fn update<R>(&self, f: impl FnOnce(&mut AutomationData) -> R) -> R {
        f(&mut self.write())
    }

    pub fn snapshot(&self) -> AutomationData {
        self.read().clone()
    }

    pub(crate) fn replace(&self, data: AutomationData) {
        *self.write() = data;
    }
}

impl std::fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DataHandle").field(&*self.read()).finish()
    }
}

// ---------------------------------------------------------------------------
// Callable inputs
// ---------------------------------------------------------------------------

/// Input to an action.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub automation_id: Uuid,
    pub automation_class: String,
    /// Declaration name of the node running the action.
    pub node: String,
    /// The step record as entered (locked, unfinished).
    pub step: StepRecord,
    /// Static arguments declared on the node.
    pub args: Vec<Value>,
    pub data: DataHandle,
}

/// Read-only input to conditions and wake-time functions.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub automation_id: Uuid,
    pub step: &'a StepRecord,
    pub data: &'a AutomationData,
    pub now: DateTime<Utc>,
}

impl GuardContext<'_> {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// True when `key` holds JSON `true`.
    pub fn flag(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Input to a message receiver.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub automation_id: Uuid,
    pub message: String,
    pub token: String,
    /// Data sent along with the message.
    pub payload: AutomationData,
    /// The receiving instance's own data.
    pub data: DataHandle,
}
