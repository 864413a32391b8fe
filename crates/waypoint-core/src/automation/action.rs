//! User callables: actions, conditions, and wake-time functions.
//!
//! Callables are stored as `Arc<dyn Fn>` so one workflow definition can be
//! shared by every instance. Actions are async and return a boxed future;
//! conditions and wake-time functions are plain synchronous predicates over a
//! data snapshot.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use super::context::{GuardContext, StepContext};
use super::reference::Ref;

/// Business error raised by an action. Captured on the step record, never
/// propagated out of the advancement loop.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),

    #[error("action panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Future returned by stored actions and receivers.
pub type ActionFuture = BoxFuture<'static, Result<Value, ActionError>>;

/// Convert an action's output to JSON. Values serde cannot represent (for
/// example maps with non-string keys) degrade to `null`.
pub(crate) fn to_json<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "action result is not serializable, storing null");
        Value::Null
    })
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// An async callable run by Execute nodes and inline If clauses.
#[derive(Clone)]
pub struct Action(Arc<dyn Fn(StepContext) -> ActionFuture + Send + Sync>);

impl Action {
    /// Wrap an async closure. The output is converted to JSON after it resolves.
    pub fn new<F, Fut, T>(f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ActionError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        Self(Arc::new(move |ctx| {
            let fut = f(ctx);
            Box::pin(async move { fut.await.map(to_json) })
        }))
    }

    /// Wrap a synchronous closure.
    pub fn sync<F, T>(f: F) -> Self
    where
        F: Fn(&StepContext) -> Result<T, ActionError> + Send + Sync + 'static,
        T: Serialize + Send + 'static,
    {
        Self::new(move |ctx| {
            let out = f(&ctx);
            async move { out }
        })
    }

    pub(crate) fn call(&self, ctx: StepContext) -> ActionFuture {
        (self.0)(ctx)
    }

    /// Like [`Action::call`], but a panic in the closure or its future comes
    /// back as [`ActionError::Panicked`].
    pub(crate) async fn call_contained(&self, ctx: StepContext) -> Result<Value, ActionError> {
        match AssertUnwindSafe(async { self.call(ctx).await }).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(ActionError::Panicked(panic_message(&*payload))),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Action(..)")
    }
}

impl From<Action> for Ref<Action> {
    fn from(action: Action) -> Self {
        Ref::Resolved(action)
    }
}

impl From<&str> for Ref<Action> {
    fn from(name: &str) -> Self {
        Ref::named(name)
    }
}

impl From<String> for Ref<Action> {
    fn from(name: String) -> Self {
        Ref::named(name)
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A synchronous predicate evaluated when a node executes.
#[derive(Clone)]
pub struct Condition(Arc<dyn Fn(&GuardContext<'_>) -> bool + Send + Sync>);

impl Condition {
    pub fn new(f: impl Fn(&GuardContext<'_>) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Condition holding when `key` is JSON `true`.
    pub fn flag(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(move |ctx| ctx.flag(&key))
    }

    pub fn check(&self, ctx: &GuardContext<'_>) -> bool {
        (self.0)(ctx)
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Condition(..)")
    }
}

impl From<Condition> for Ref<Condition> {
    fn from(condition: Condition) -> Self {
        Ref::Resolved(condition)
    }
}

impl From<&str> for Ref<Condition> {
    fn from(name: &str) -> Self {
        Ref::named(name)
    }
}

impl From<String> for Ref<Condition> {
    fn from(name: String) -> Self {
        Ref::named(name)
    }
}

// ---------------------------------------------------------------------------
// WakeTime
// ---------------------------------------------------------------------------

/// Computes the earliest time a node may run.
#[derive(Clone)]
pub struct WakeTime(Arc<dyn Fn(&GuardContext<'_>) -> DateTime<Utc> + Send + Sync>);

impl WakeTime {
    pub fn new(f: impl Fn(&GuardContext<'_>) -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn at(&self, ctx: &GuardContext<'_>) -> DateTime<Utc> {
        (self.0)(ctx)
    }
}

impl std::fmt::Debug for WakeTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WakeTime(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::context::DataHandle;
    use std::collections::HashMap;
    use uuid::Uuid;
    use waypoint_types::step::StepRecord;

    fn ctx() -> StepContext {
        let step = StepRecord::new(Uuid::now_v7(), None, "work");
        StepContext {
            automation_id: step.automation_id,
            automation_class: "test".into(),
            node: "work".into(),
            step,
            args: vec![Value::from(2)],
            data: DataHandle::default(),
        }
    }

    #[tokio::test]
    async fn test_sync_action_serializes_output() {
        let action = Action::sync(|ctx| {
            let n = ctx.args[0].as_i64().unwrap_or(0);
            Ok(vec![n, n * 2])
        });
        let value = action.call(ctx()).await.unwrap();
        assert_eq!(value, serde_json::json!([2, 4]));
    }

    #[tokio::test]
    async fn test_async_action_mutates_data() {
        let action = Action::new(|ctx: StepContext| async move {
            ctx.data.set("seen", true);
            Ok::<_, ActionError>(())
        });
        let c = ctx();
        let data = c.data.clone();
        assert_eq!(action.call(c).await.unwrap(), Value::Null);
        assert_eq!(data.get("seen"), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_unserializable_output_degrades_to_null() {
        let action = Action::sync(|_| {
            let mut map = HashMap::new();
            map.insert((1, 2), "tuple keys are not JSON");
            Ok(map)
        });
        assert_eq!(action.call(ctx()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_action_error_passes_through() {
        let action = Action::sync(|_| Err::<(), _>(ActionError::failed("boom")));
        let err = action.call(ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_contained_call_catches_panics() {
        let sync = Action::sync(|_| -> Result<(), ActionError> { panic!("sync boom") });
        let err = sync.call_contained(ctx()).await.unwrap_err();
        assert!(matches!(err, ActionError::Panicked(ref m) if m == "sync boom"));

        let late = Action::new(|_ctx: StepContext| async move {
            tokio::task::yield_now().await;
            if true {
                panic!("late {}", 42);
            }
            Ok::<_, ActionError>(())
        });
        let err = late.call_contained(ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "action panicked: late 42");

        let fine = Action::sync(|_| Ok(1));
        assert_eq!(fine.call_contained(ctx()).await.unwrap(), Value::from(1));
    }

    #[test]
    fn test_condition_flag() {
        let step = StepRecord::new(Uuid::now_v7(), None, "gate");
        let mut data = waypoint_types::automation::AutomationData::new();
        data.insert("go".into(), Value::Bool(true));
        let g = GuardContext {
            automation_id: step.automation_id,
            step: &step,
            data: &data,
            now: Utc::now(),
        };
        assert!(Condition::flag("go").check(&g));
        assert!(!Condition::flag("stop").check(&g));
    }
}
