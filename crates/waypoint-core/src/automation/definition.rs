//! Workflow definitions.
//!
//! A [`WorkflowDefinition`] is the immutable, shared graph for one automation
//! class: an ordered list of named nodes plus the receivers and policies that
//! apply to its instances. Definitions are assembled with
//! [`DefinitionBuilder`]; `build()` validates every node, resolves every name
//! reference exactly once, and fails with a [`ConfigError`] on the first
//! defect.

use std::collections::HashMap;
use std::sync::Arc;

use waypoint_types::automation::AutomationData;

use super::action::{Action, Condition};
use super::context::DataHandle;
use super::error::{ConfigError, NodeProblem};
use super::message::Receiver;
use super::node::{Node, NodeId, NodeKind};

/// Hook run when an event trigger creates an instance. Receives the new
/// instance's data and the trigger payload.
pub type StartHook = Arc<dyn Fn(&DataHandle, &AutomationData) + Send + Sync>;

/// How many unfinished instances of a class may exist at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Uniqueness {
    #[default]
    None,
    /// At most one; creating another returns the existing instance.
    Singleton,
    /// At most one per combination of values of these data fields.
    ByFields(Vec<String>),
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

pub struct WorkflowDefinition {
    class: String,
    verbose_name: String,
    verbose_name_plural: String,
    names: Vec<String>,
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
    receivers: HashMap<String, Receiver>,
    uniqueness: Uniqueness,
    autorun: bool,
    started_by: Option<StartHook>,
}

impl WorkflowDefinition {
    pub fn builder(class: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder::new(class)
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn verbose_name(&self) -> &str {
        &self.verbose_name
    }

    pub fn verbose_name_plural(&self) -> &str {
        &self.verbose_name_plural
    }

    pub fn uniqueness(&self) -> &Uniqueness {
        &self.uniqueness
    }

    /// Whether new instances are advanced right after creation.
    pub fn autorun(&self) -> bool {
        self.autorun
    }

    pub fn started_by(&self) -> Option<&StartHook> {
        self.started_by.as_ref()
    }

    /// Node names in declaration order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub(crate) fn require_node(&self, name: &str) -> Result<NodeId, ConfigError> {
        self.node_id(name)
            .ok_or_else(|| ConfigError::UnknownNode(name.to_string()))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_name(&self, id: NodeId) -> &str {
        &self.names[id]
    }

    pub(crate) fn first_node(&self) -> NodeId {
        0
    }

    pub(crate) fn kind_of(&self, name: &str) -> Option<&NodeKind> {
        self.node_id(name).map(|id| &self.nodes[id].kind)
    }

    /// Successor of `id` when no per-occurrence override applies: the
    /// explicit `next` if declared, else the following node in declaration order.
    pub(crate) fn successor(&self, id: NodeId) -> Result<NodeId, ConfigError> {
        let node = &self.nodes[id];
        if let Some(next) = &node.next {
            return next
                .get()
                .copied()
                .map_err(|problem| ConfigError::node(&self.names[id], problem));
        }
        if id + 1 < self.nodes.len() {
            Ok(id + 1)
        } else {
            Err(ConfigError::NoSuccessor(self.names[id].clone()))
        }
    }

    pub fn receiver(&self, message: &str) -> Option<&Receiver> {
        self.receivers.get(message)
    }

    /// Whether `payload` satisfies the requirements of the receiver for
    /// `message`. False when no such receiver exists.
    pub fn satisfies_data_requirements(&self, message: &str, payload: Option<&AutomationData>) -> bool {
        self.receiver(message)
            .is_some_and(|receiver| receiver.accepts(payload))
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("class", &self.class)
            .field("nodes", &self.names)
            .field("uniqueness", &self.uniqueness)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// DefinitionBuilder
// ---------------------------------------------------------------------------

/// Registers nodes in declaration order. Declaration order supplies the
/// implicit successor of every node without an explicit `next`.
pub struct DefinitionBuilder {
    class: String,
    verbose_name: Option<String>,
    verbose_name_plural: Option<String>,
    nodes: Vec<(String, Node)>,
    methods: HashMap<String, Action>,
    predicates: HashMap<String, Condition>,
    receivers: HashMap<String, Receiver>,
    uniqueness: Uniqueness,
    autorun: bool,
    started_by: Option<StartHook>,
    errors: Vec<ConfigError>,
}

impl DefinitionBuilder {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            verbose_name: None,
            verbose_name_plural: None,
            nodes: Vec::new(),
            methods: HashMap::new(),
            predicates: HashMap::new(),
            receivers: HashMap::new(),
            uniqueness: Uniqueness::None,
            autorun: true,
            started_by: None,
            errors: Vec::new(),
        }
    }

    pub fn node(mut self, name: impl Into<String>, node: Node) -> Self {
        let name = name.into();
        if self.nodes.iter().any(|(existing, _)| *existing == name) {
            self.errors.push(ConfigError::DuplicateNode(name));
        } else {
            self.nodes.push((name, node));
        }
        self
    }

    /// Register a named action that nodes may reference by name.
    pub fn method(mut self, name: impl Into<String>, action: Action) -> Self {
        self.methods.insert(name.into(), action);
        self
    }

    /// Register a named condition that nodes may reference by name.
    pub fn predicate(mut self, name: impl Into<String>, condition: Condition) -> Self {
        self.predicates.insert(name.into(), condition);
        self
    }

    pub fn receiver(mut self, message: impl Into<String>, receiver: Receiver) -> Self {
        self.receivers.insert(message.into(), receiver);
        self
    }

    pub fn unique(mut self, uniqueness: Uniqueness) -> Self {
        self.uniqueness = uniqueness;
        self
    }

    pub fn verbose_name(mut self, name: impl Into<String>) -> Self {
        self.verbose_name = Some(name.into());
        self
    }

    pub fn verbose_name_plural(mut self, name: impl Into<String>) -> Self {
        self.verbose_name_plural = Some(name.into());
        self
    }

    pub fn autorun(mut self, autorun: bool) -> Self {
        self.autorun = autorun;
        self
    }

    pub fn started_by(mut self, hook: impl Fn(&DataHandle, &AutomationData) + Send + Sync + 'static) -> Self {
        self.started_by = Some(Arc::new(hook));
        self
    }

    /// Validate the graph and bind every reference.
    pub fn build(self) -> Result<Arc<WorkflowDefinition>, ConfigError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::EmptyDefinition(self.class));
        }

        let (names, mut nodes): (Vec<String>, Vec<Node>) = self.nodes.into_iter().unzip();
        let index: HashMap<String, NodeId> = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();

        for (name, node) in names.iter().zip(nodes.iter_mut()) {
            node.validate()
                .map_err(|problem| ConfigError::node(name, problem))?;
            bind(node, &index, &self.methods, &self.predicates)
                .map_err(|problem| ConfigError::node(name, problem))?;
        }

        let has_join = nodes.iter().any(|n| matches!(n.kind, NodeKind::Join));
        let has_fork = nodes.iter().any(|n| matches!(n.kind, NodeKind::Fork(_)));
        if has_join && !has_fork {
            return Err(ConfigError::JoinWithoutFork(self.class));
        }

        let verbose_name = self
            .verbose_name
            .unwrap_or_else(|| format!("Automation {}", self.class));
        let verbose_name_plural = self
            .verbose_name_plural
            .unwrap_or_else(|| format!("Automations {}", self.class));

        tracing::debug!(class = %self.class, nodes = names.len(), "built workflow definition");

        Ok(Arc::new(WorkflowDefinition {
            class: self.class,
            verbose_name,
            verbose_name_plural,
            names,
            nodes,
            index,
            receivers: self.receivers,
            uniqueness: self.uniqueness,
            autorun: self.autorun,
            started_by: self.started_by,
        }))
    }
}

/// Resolve every name reference held by `node`.
fn bind(
    node: &mut Node,
    index: &HashMap<String, NodeId>,
    methods: &HashMap<String, Action>,
    predicates: &HashMap<String, Condition>,
) -> Result<(), NodeProblem> {
    for target in node.node_refs_mut() {
        target.resolve(|name| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| NodeProblem::UnknownNode(name.to_string()))
        })?;
    }
    for action in node.action_refs_mut() {
        action.resolve(|name| {
            methods
                .get(name)
                .cloned()
                .ok_or_else(|| NodeProblem::UnknownMethod(name.to_string()))
        })?;
    }
    for condition in node.condition_refs_mut() {
        condition.resolve(|name| {
            predicates
                .get(name)
                .cloned()
                .ok_or_else(|| NodeProblem::UnknownPredicate(name.to_string()))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::action::ActionError;
    use crate::automation::message::ParamType;

    #[test]
    fn test_declaration_order_is_implicit_successor() {
        let def = WorkflowDefinition::builder("flow")
            .node("a", Node::noop())
            .node("b", Node::noop())
            .node("c", Node::end())
            .build()
            .unwrap();
        assert_eq!(def.successor(0).unwrap(), 1);
        assert_eq!(def.successor(1).unwrap(), 2);
        assert_eq!(def.node_names().collect::<Vec<_>>(), ["a", "b", "c"]);
    }

    #[test]
    fn test_explicit_next_wins() {
        let def = WorkflowDefinition::builder("flow")
            .node("a", Node::noop().next("c"))
            .node("b", Node::noop())
            .node("c", Node::end())
            .build()
            .unwrap();
        assert_eq!(def.successor(0).unwrap(), 2);
    }

    #[test]
    fn test_last_node_without_end_has_no_successor() {
        let def = WorkflowDefinition::builder("flow")
            .node("only", Node::noop())
            .build()
            .unwrap();
        assert_eq!(def.successor(0), Err(ConfigError::NoSuccessor("only".into())));
    }

    #[test]
    fn test_unknown_references_are_rejected() {
        let err = WorkflowDefinition::builder("flow")
            .node("a", Node::noop().next("nowhere"))
            .node("b", Node::end())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::node("a", NodeProblem::UnknownNode("nowhere".into()))
        );

        let err = WorkflowDefinition::builder("flow")
            .node("a", Node::execute("missing_method"))
            .node("b", Node::end())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::node("a", NodeProblem::UnknownMethod("missing_method".into()))
        );

        let err = WorkflowDefinition::builder("flow")
            .node("a", Node::wait().as_soon_as("ready"))
            .node("b", Node::end())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::node("a", NodeProblem::UnknownPredicate("ready".into()))
        );
    }

    #[test]
    fn test_named_method_and_predicate_resolve() {
        let def = WorkflowDefinition::builder("flow")
            .method("init", Action::sync(|_| Ok::<_, ActionError>(())))
            .predicate("ready", Condition::flag("ready"))
            .node("a", Node::execute("init").as_soon_as("ready"))
            .node("b", Node::end())
            .build()
            .unwrap();
        assert!(def.node(0).conditions[0].is_resolved());
    }

    #[test]
    fn test_duplicate_node_and_empty_definition() {
        let err = WorkflowDefinition::builder("flow")
            .node("a", Node::noop())
            .node("a", Node::end())
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateNode("a".into()));

        let err = WorkflowDefinition::builder("flow").build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyDefinition("flow".into()));
    }

    #[test]
    fn test_join_requires_a_fork() {
        let err = WorkflowDefinition::builder("flow")
            .node("a", Node::noop())
            .node("j", Node::join())
            .node("z", Node::end())
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::JoinWithoutFork("flow".into()));
    }

    #[test]
    fn test_verbose_names_default_from_class() {
        let def = WorkflowDefinition::builder("signup")
            .node("z", Node::end())
            .build()
            .unwrap();
        assert_eq!(def.verbose_name(), "Automation signup");
        assert_eq!(def.verbose_name_plural(), "Automations signup");
        assert!(def.autorun());
    }

    #[test]
    fn test_satisfies_data_requirements() {
        let def = WorkflowDefinition::builder("signup")
            .receiver(
                "subscribe",
                Receiver::sync(|_| Ok(())).require("email", ParamType::Str),
            )
            .node("z", Node::end())
            .build()
            .unwrap();

        let mut payload = AutomationData::new();
        assert!(!def.satisfies_data_requirements("subscribe", Some(&payload)));
        payload.insert("email".into(), "a@b.c".into());
        assert!(def.satisfies_data_requirements("subscribe", Some(&payload)));
        assert!(!def.satisfies_data_requirements("unknown", Some(&payload)));
    }
}
