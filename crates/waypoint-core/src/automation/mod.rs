//! Automation engine: node graphs, definitions, and the advancement loop.
//!
//! - `node` -- node kinds and their declaration builders
//! - `reference` -- lazily resolved name references to nodes and callables
//! - `action` -- user callables (actions, conditions, wake-time functions)
//! - `context` -- data handle and the contexts passed to callables
//! - `message` -- receivers and their parameter requirements
//! - `definition` -- validated, shared workflow graphs and their builder
//! - `registry` -- definitions by class name
//! - `engine` -- engine handle and bound automation instances
//! - `advance` -- the step advancement algorithm
//! - `dispatch` -- message delivery between instances
//! - `interaction` -- listing and validating interaction gates
//! - `driver` -- periodic tick and the long-running ticker
//! - `trigger` -- event-triggered starts

pub mod action;
pub mod advance;
pub mod context;
pub mod definition;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod error;
pub mod interaction;
pub mod message;
pub mod node;
pub mod reference;
pub mod registry;
pub mod trigger;

pub use action::{Action, ActionError, Condition, WakeTime};
pub use advance::RunOutcome;
pub use context::{DataHandle, GuardContext, MessageContext, StepContext};
pub use definition::{DefinitionBuilder, Uniqueness, WorkflowDefinition};
pub use driver::{TickReport, Ticker};
pub use engine::{Automation, Engine};
pub use error::{ConfigError, EngineError, NodeProblem};
pub use interaction::{GateView, ValidateOutcome};
pub use message::{ParamType, Receiver, RECEIVED};
pub use node::{Interval, MessageTarget, Node};
pub use registry::Registry;
pub use trigger::{Trigger, TriggerError, TriggerEvent, TriggerHub};
