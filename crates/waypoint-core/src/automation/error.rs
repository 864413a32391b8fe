//! Engine error types.
//!
//! Configuration errors describe a malformed graph and are always fatal.
//! Business errors raised by actions never appear here; they are captured
//! on the step record (see [`super::action::ActionError`]).

use thiserror::Error;
use uuid::Uuid;
use waypoint_types::error::RepositoryError;

/// A defect in a single node's declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeProblem {
    #[error("successor declared twice")]
    DuplicateNext,

    #[error("time guard declared twice")]
    DuplicateTimeGuard,

    #[error("repeat interval declared twice")]
    DuplicateInterval,

    #[error("repeat node has no interval")]
    MissingInterval,

    #[error("repeat interval must be positive")]
    InvalidInterval,

    #[error("If node has no Then clause")]
    MissingThen,

    #[error("{0} clause declared twice")]
    DuplicateClause(&'static str),

    #[error("OnError declared twice")]
    DuplicateOnError,

    #[error("{0} declared twice")]
    DuplicateRequirement(&'static str),

    #[error("interaction gate declares no user, group or permission")]
    GateWithoutTarget,

    #[error("a detached action cannot declare OnError")]
    DetachedWithOnError,

    #[error("Fork declares no successors")]
    ForkWithoutBranches,

    #[error("Join has no Fork ancestor")]
    JoinWithoutFork,

    #[error("'{0}' does not apply to this kind of node")]
    NotApplicable(&'static str),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("unknown predicate '{0}'")]
    UnknownPredicate(String),

    #[error("reference '{0}' used before it was resolved")]
    Unresolved(String),
}

/// Malformed workflow definitions. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("node '{node}': {problem}")]
    Node { node: String, problem: NodeProblem },

    #[error("node '{0}' has no successor and is not an End node")]
    NoSuccessor(String),

    #[error("workflow '{0}' declares no nodes")]
    EmptyDefinition(String),

    #[error("node name '{0}' declared twice")]
    DuplicateNode(String),

    #[error("no node named '{0}'")]
    UnknownNode(String),

    #[error("workflow '{0}' declares a Join but no Fork")]
    JoinWithoutFork(String),

    #[error("unknown workflow class '{0}'")]
    UnknownClass(String),
}

impl ConfigError {
    pub(crate) fn node(node: &str, problem: NodeProblem) -> Self {
        Self::Node {
            node: node.to_string(),
            problem,
        }
    }
}

/// Errors escaping the advancement entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("automation {0} is already finished")]
    AlreadyFinished(Uuid),

    #[error("automation {0} not found")]
    AutomationNotFound(Uuid),

    #[error("step {0} not found")]
    StepNotFound(Uuid),

    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("actor may not act on this step")]
    PermissionDenied,

    #[error("node '{0}' is not an interaction gate")]
    NotAnInteraction(String),
}
