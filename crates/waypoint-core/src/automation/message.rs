//! Message receivers.
//!
//! A definition registers receivers by message name. A receiver may declare
//! required payload parameters; delivery is refused (not an error) when a
//! parameter is missing or fails its type check.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use waypoint_types::automation::AutomationData;

use super::action::{to_json, ActionError, ActionFuture};
use super::context::MessageContext;

/// Value a receiver returns to stop a broadcast.
pub const RECEIVED: &str = "received";

/// Type check applied to a required payload parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// Any scalar; numbers and booleans are accepted as their text form.
    Str,
    /// An integer, or a string that parses as one.
    Int,
    /// A number, or a string that parses as one.
    Float,
    /// A boolean, or the strings "true" / "false".
    Bool,
    /// Present with any value.
    Any,
}

impl ParamType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Str => matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)),
            Self::Int => match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.trim().parse::<i64>().is_ok(),
                _ => false,
            },
            Self::Float => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            Self::Bool => match value {
                Value::Bool(_) => true,
                Value::String(s) => matches!(s.as_str(), "true" | "false"),
                _ => false,
            },
        }
    }
}

type ReceiverFn = Arc<dyn Fn(MessageContext) -> ActionFuture + Send + Sync>;

/// A named message handler.
#[derive(Clone)]
pub struct Receiver {
    handler: ReceiverFn,
    required: Vec<(String, ParamType)>,
}

impl Receiver {
    pub fn new<F, Fut, T>(f: F) -> Self
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ActionError>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        Self {
            handler: Arc::new(move |ctx| {
                let fut = f(ctx);
                Box::pin(async move { fut.await.map(to_json) })
            }),
            required: Vec::new(),
        }
    }

    /// Wrap a synchronous handler.
    pub fn sync<F, T>(f: F) -> Self
    where
        F: Fn(&MessageContext) -> Result<T, ActionError> + Send + Sync + 'static,
        T: Serialize + Send + 'static,
    {
        Self::new(move |ctx| {
            let out = f(&ctx);
            async move { out }
        })
    }

    /// Require a payload parameter of the given type.
    pub fn require(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.required.push((name.into(), ty));
        self
    }

    /// Whether `payload` carries every required parameter with an acceptable value.
    pub fn accepts(&self, payload: Option<&AutomationData>) -> bool {
        self.required.iter().all(|(name, ty)| {
            payload
                .and_then(|p| p.get(name))
                .is_some_and(|value| ty.accepts(value))
        })
    }

    pub(crate) fn call(&self, ctx: MessageContext) -> ActionFuture {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> AutomationData {
        match v {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_param_type_coercion() {
        assert!(ParamType::Int.accepts(&json!(2)));
        assert!(ParamType::Int.accepts(&json!("2")));
        assert!(!ParamType::Int.accepts(&json!("t2")));
        assert!(!ParamType::Int.accepts(&json!(2.5)));
        assert!(ParamType::Float.accepts(&json!("2.5")));
        assert!(ParamType::Bool.accepts(&json!("false")));
        assert!(!ParamType::Bool.accepts(&json!(1)));
        assert!(ParamType::Str.accepts(&json!(7)));
        assert!(!ParamType::Str.accepts(&Value::Null));
        assert!(ParamType::Any.accepts(&Value::Null));
    }

    #[test]
    fn test_receiver_requirements() {
        let receiver = Receiver::sync(|_| Ok(RECEIVED))
            .require("email", ParamType::Str)
            .require("mails", ParamType::Int);

        assert!(receiver.accepts(Some(&payload(json!({"email": "a@b.c", "mails": "2"})))));
        assert!(!receiver.accepts(Some(&payload(json!({"email": "a@b.c", "mails": "t2"})))));
        assert!(!receiver.accepts(Some(&payload(json!({"email": "a@b.c"})))));
        assert!(!receiver.accepts(None));
    }

    #[test]
    fn test_receiver_without_requirements_accepts_anything() {
        let receiver = Receiver::sync(|_| Ok(()));
        assert!(receiver.accepts(None));
        assert!(receiver.accepts(Some(&AutomationData::new())));
    }
}
