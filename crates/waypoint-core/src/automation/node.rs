//! Node declarations.
//!
//! A [`Node`] is one vertex of a workflow graph. Nodes are declared with a
//! fluent builder; declaration mistakes (a second successor, a second time
//! guard, a modifier on the wrong kind of node) are recorded on the node and
//! reported by `DefinitionBuilder::build`.
//!
//! ```ignore
//! Node::execute("send_welcome")
//!     .after_pausing_for(Duration::hours(1))
//!     .on_error("notify_admin")
//! ```

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde_json::Value;
use waypoint_types::actor::InteractionRequirement;
use waypoint_types::automation::AutomationData;

use super::action::{Action, Condition, WakeTime};
use super::context::GuardContext;
use super::error::NodeProblem;
use super::reference::Ref;

/// Index of a node within its definition, in declaration order.
pub type NodeId = usize;

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    /// Pass-through; only its guards do anything.
    Wait,
    Execute(ExecuteSpec),
    If(BranchSpec),
    Repeat(RepeatSpec),
    Fork(ForkSpec),
    Join,
    Form(FormSpec),
    SendMessage(SendSpec),
    End,
}

impl NodeKind {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Execute(_) => "execute",
            Self::If(_) => "if",
            Self::Repeat(_) => "repeat",
            Self::Fork(_) => "fork",
            Self::Join => "join",
            Self::Form(_) => "form",
            Self::SendMessage(_) => "send_message",
            Self::End => "end",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ExecuteSpec {
    pub callable: Option<Ref<Action>>,
    pub args: Vec<Value>,
    pub detached: bool,
    pub on_error: Option<Ref<NodeId>>,
}

/// One arm of an If node.
#[derive(Debug, Clone)]
pub(crate) enum Clause {
    /// Jump to another node.
    Goto(Ref<NodeId>),
    /// Run an inline action, then continue in declaration order.
    Run(Ref<Action>),
}

#[derive(Debug, Clone)]
pub(crate) struct BranchSpec {
    pub condition: Ref<Condition>,
    pub then: Option<Clause>,
    pub otherwise: Option<Clause>,
    pub on_error: Option<Ref<NodeId>>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RepeatSpec {
    pub interval: Option<Interval>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ForkSpec {
    pub branches: Vec<Ref<NodeId>>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FormSpec {
    pub form: String,
    pub template: Option<String>,
    pub requirement: InteractionRequirement,
}

/// Where a SendMessage node delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// Broadcast to every unfinished instance of a class.
    Class(String),
    /// Point-to-point by unique key or instance id.
    Key(String),
}

impl MessageTarget {
    pub fn class(name: impl Into<String>) -> Self {
        Self::Class(name.into())
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SendSpec {
    pub target: MessageTarget,
    pub message: String,
    pub token: String,
    pub payload: Option<AutomationData>,
}

/// Wait-gate time guard.
#[derive(Debug, Clone)]
pub(crate) enum TimeGuard {
    Until(WakeTime),
    /// Measured from the step's creation.
    PauseFor(Duration),
}

impl TimeGuard {
    pub(crate) fn wake_time(&self, ctx: &GuardContext<'_>) -> DateTime<Utc> {
        match self {
            Self::Until(f) => f.at(ctx),
            Self::PauseFor(d) => ctx.step.created_at + *d,
        }
    }
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// Cadence of a Repeat node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    /// A fixed period, counted from the first arrival.
    Every(Duration),
    /// Once a day at the given UTC wall-clock time.
    DailyAt(NaiveTime),
}

impl Interval {
    pub fn minutes(n: i64) -> Self {
        Self::Every(Duration::minutes(n))
    }

    pub fn hours(n: i64) -> Self {
        Self::Every(Duration::hours(n))
    }

    pub fn days(n: i64) -> Self {
        Self::Every(Duration::days(n))
    }

    pub fn daily_at(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self::DailyAt)
    }

    pub fn period(&self) -> Duration {
        match self {
            Self::Every(d) => *d,
            Self::DailyAt(_) => Duration::days(1),
        }
    }

    /// First fire time for a Repeat node first reached at `now`.
    pub fn first_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Every(d) => now + *d,
            Self::DailyAt(time) => {
                let today = now.date_naive().and_time(*time).and_utc();
                if today > now {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One vertex of a workflow graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) next: Option<Ref<NodeId>>,
    pub(crate) conditions: Vec<Ref<Condition>>,
    pub(crate) wait: Option<TimeGuard>,
    pub(crate) skip_if: Option<Ref<Condition>>,
    pub(crate) skip_after: Option<Duration>,
    pub(crate) description: Option<String>,
    pub(crate) problems: Vec<NodeProblem>,
}

impl Node {
    fn of(kind: NodeKind) -> Self {
        Self {
            kind,
            next: None,
            conditions: Vec::new(),
            wait: None,
            skip_if: None,
            skip_after: None,
            description: None,
            problems: Vec::new(),
        }
    }

    // -- constructors --

    /// Run an action: a closure (`Action::new`/`Action::sync`) or the name of
    /// a method registered on the definition.
    pub fn execute(action: impl Into<Ref<Action>>) -> Self {
        Self::of(NodeKind::Execute(ExecuteSpec {
            callable: Some(action.into()),
            ..ExecuteSpec::default()
        }))
    }

    /// An Execute node without a callable.
    pub fn noop() -> Self {
        Self::of(NodeKind::Execute(ExecuteSpec::default()))
    }

    /// A node that does nothing but honour its guards.
    pub fn wait() -> Self {
        Self::of(NodeKind::Wait)
    }

    /// Branch on a condition (closure or registered predicate name).
    pub fn branch(condition: impl Into<Ref<Condition>>) -> Self {
        Self::of(NodeKind::If(BranchSpec {
            condition: condition.into(),
            then: None,
            otherwise: None,
            on_error: None,
        }))
    }

    /// Jump back to an earlier node on a fixed cadence. Set the target with
    /// [`Node::start_from`] and the cadence with one interval method.
    pub fn repeat() -> Self {
        Self::of(NodeKind::Repeat(RepeatSpec::default()))
    }

    /// Split into concurrent branches; add them with [`Node::next`].
    pub fn fork() -> Self {
        Self::of(NodeKind::Fork(ForkSpec::default()))
    }

    pub fn join() -> Self {
        Self::of(NodeKind::Join)
    }

    /// Suspend until an actor validates the named form.
    pub fn form(form: impl Into<String>) -> Self {
        Self::of(NodeKind::Form(FormSpec {
            form: form.into(),
            ..FormSpec::default()
        }))
    }

    pub fn send_message(
        target: MessageTarget,
        message: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self::of(NodeKind::SendMessage(SendSpec {
            target,
            message: message.into(),
            token: token.into(),
            payload: None,
        }))
    }

    pub fn end() -> Self {
        Self::of(NodeKind::End)
    }

    // -- modifiers common to all nodes --

    /// Explicit successor. On a Fork, each call adds a branch.
    pub fn next(mut self, node: impl Into<String>) -> Self {
        if let NodeKind::Fork(spec) = &mut self.kind {
            spec.branches.push(Ref::named(node));
            return self;
        }
        if self.next.is_some() {
            self.problems.push(NodeProblem::DuplicateNext);
        } else {
            self.next = Some(Ref::named(node));
        }
        self
    }

    /// Only proceed once `condition` holds. Conditions accumulate (logical AND).
    pub fn as_soon_as(mut self, condition: impl Into<Ref<Condition>>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    /// Only proceed once the computed time has passed.
    pub fn after_waiting_until(
        self,
        f: impl Fn(&GuardContext<'_>) -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.time_guard(TimeGuard::Until(WakeTime::new(f)))
    }

    /// Only proceed once `duration` has passed since the step was first entered.
    pub fn after_pausing_for(self, duration: Duration) -> Self {
        self.time_guard(TimeGuard::PauseFor(duration))
    }

    /// Alias of [`Node::after_pausing_for`].
    pub fn after_waiting_for(self, duration: Duration) -> Self {
        self.after_pausing_for(duration)
    }

    fn time_guard(mut self, guard: TimeGuard) -> Self {
        if self.wait.is_some() {
            self.problems.push(NodeProblem::DuplicateTimeGuard);
        } else {
            self.wait = Some(guard);
        }
        self
    }

    /// Skip this node's work (guards and action) when `condition` holds.
    pub fn skip_if(mut self, condition: impl Into<Ref<Condition>>) -> Self {
        self.skip_if = Some(condition.into());
        self
    }

    /// Skip this node's work once its step is older than `duration`.
    pub fn skip_after(mut self, duration: Duration) -> Self {
        self.skip_after = Some(duration);
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    // -- Execute / If --

    /// Append a static argument passed to the action.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        match &mut self.kind {
            NodeKind::Execute(spec) => spec.args.push(value.into()),
            _ => self.problems.push(NodeProblem::NotApplicable("arg")),
        }
        self
    }

    /// Run the action on its own task and continue without waiting for it.
    pub fn detached(mut self) -> Self {
        match &mut self.kind {
            NodeKind::Execute(spec) => spec.detached = true,
            _ => self.problems.push(NodeProblem::NotApplicable("detached")),
        }
        self
    }

    /// Continue at `node` when the action fails.
    pub fn on_error(mut self, node: impl Into<String>) -> Self {
        let slot = match &mut self.kind {
            NodeKind::Execute(spec) => &mut spec.on_error,
            NodeKind::If(spec) => &mut spec.on_error,
            _ => {
                self.problems.push(NodeProblem::NotApplicable("on_error"));
                return self;
            }
        };
        if slot.is_some() {
            self.problems.push(NodeProblem::DuplicateOnError);
        } else {
            *slot = Some(Ref::named(node));
        }
        self
    }

    pub fn then_goto(self, node: impl Into<String>) -> Self {
        self.clause(true, Clause::Goto(Ref::named(node)))
    }

    pub fn then_run(self, action: impl Into<Ref<Action>>) -> Self {
        self.clause(true, Clause::Run(action.into()))
    }

    pub fn else_goto(self, node: impl Into<String>) -> Self {
        self.clause(false, Clause::Goto(Ref::named(node)))
    }

    pub fn else_run(self, action: impl Into<Ref<Action>>) -> Self {
        self.clause(false, Clause::Run(action.into()))
    }

    fn clause(mut self, then: bool, clause: Clause) -> Self {
        let NodeKind::If(spec) = &mut self.kind else {
            self.problems
                .push(NodeProblem::NotApplicable(if then { "then" } else { "else" }));
            return self;
        };
        let (slot, label) = if then {
            (&mut spec.then, "Then")
        } else {
            (&mut spec.otherwise, "Else")
        };
        if slot.is_some() {
            self.problems.push(NodeProblem::DuplicateClause(label));
        } else {
            *slot = Some(clause);
        }
        self
    }

    // -- Repeat --

    /// Node the Repeat jumps back to.
    pub fn start_from(mut self, node: impl Into<String>) -> Self {
        if !matches!(self.kind, NodeKind::Repeat(_)) {
            self.problems.push(NodeProblem::NotApplicable("start_from"));
            return self;
        }
        self.next(node)
    }

    pub fn every(mut self, interval: Interval) -> Self {
        match &mut self.kind {
            NodeKind::Repeat(spec) if spec.interval.is_some() => {
                self.problems.push(NodeProblem::DuplicateInterval);
            }
            NodeKind::Repeat(spec) => spec.interval = Some(interval),
            _ => self.problems.push(NodeProblem::NotApplicable("interval")),
        }
        self
    }

    pub fn every_n_minutes(self, minutes: i64) -> Self {
        self.every(Interval::minutes(minutes))
    }

    pub fn every_hour(self, hours: i64) -> Self {
        self.every(Interval::hours(hours))
    }

    pub fn every_n_days(self, days: i64) -> Self {
        self.every(Interval::days(days))
    }

    pub fn every_day_at(mut self, hour: u32, minute: u32) -> Self {
        match Interval::daily_at(hour, minute) {
            Some(interval) => self.every(interval),
            None => {
                self.problems.push(NodeProblem::NotApplicable("every_day_at"));
                self
            }
        }
    }

    // -- Form --

    /// Restrict the gate to one user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        match &mut self.kind {
            NodeKind::Form(spec) if spec.requirement.user.is_some() => {
                self.problems.push(NodeProblem::DuplicateRequirement("user"));
            }
            NodeKind::Form(spec) => spec.requirement.user = Some(user.into()),
            _ => self.problems.push(NodeProblem::NotApplicable("user")),
        }
        self
    }

    /// Restrict the gate to members of a group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        match &mut self.kind {
            NodeKind::Form(spec) if spec.requirement.group.is_some() => {
                self.problems.push(NodeProblem::DuplicateRequirement("group"));
            }
            NodeKind::Form(spec) => spec.requirement.group = Some(group.into()),
            _ => self.problems.push(NodeProblem::NotApplicable("group")),
        }
        self
    }

    /// Require a permission. Permissions accumulate.
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        match &mut self.kind {
            NodeKind::Form(spec) => spec.requirement.permissions.push(permission.into()),
            _ => self.problems.push(NodeProblem::NotApplicable("permission")),
        }
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        match &mut self.kind {
            NodeKind::Form(spec) => spec.template = Some(template.into()),
            _ => self.problems.push(NodeProblem::NotApplicable("template")),
        }
        self
    }

    // -- SendMessage --

    pub fn payload(mut self, payload: AutomationData) -> Self {
        match &mut self.kind {
            NodeKind::SendMessage(spec) => spec.payload = Some(payload),
            _ => self.problems.push(NodeProblem::NotApplicable("payload")),
        }
        self
    }

    // -- accessors --

    pub fn kind_label(&self) -> &'static str {
        self.kind.label()
    }

    pub fn description_text(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub(crate) fn is_end(&self) -> bool {
        matches!(self.kind, NodeKind::End)
    }

    /// Every node reference this node holds, for resolution.
    pub(crate) fn node_refs_mut(&mut self) -> Vec<&mut Ref<NodeId>> {
        let mut refs: Vec<&mut Ref<NodeId>> = self.next.iter_mut().collect();
        match &mut self.kind {
            NodeKind::Execute(spec) => refs.extend(spec.on_error.iter_mut()),
            NodeKind::If(spec) => {
                refs.extend(spec.on_error.iter_mut());
                for clause in [&mut spec.then, &mut spec.otherwise].into_iter().flatten() {
                    if let Clause::Goto(target) = clause {
                        refs.push(target);
                    }
                }
            }
            NodeKind::Fork(spec) => refs.extend(spec.branches.iter_mut()),
            _ => {}
        }
        refs
    }

    /// Every action reference this node holds, for resolution.
    pub(crate) fn action_refs_mut(&mut self) -> Vec<&mut Ref<Action>> {
        match &mut self.kind {
            NodeKind::Execute(spec) => spec.callable.iter_mut().collect(),
            NodeKind::If(spec) => [&mut spec.then, &mut spec.otherwise]
                .into_iter()
                .flatten()
                .filter_map(|clause| match clause {
                    Clause::Run(action) => Some(action),
                    Clause::Goto(_) => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Every condition reference this node holds, for resolution.
    pub(crate) fn condition_refs_mut(&mut self) -> Vec<&mut Ref<Condition>> {
        let mut refs: Vec<&mut Ref<Condition>> = self.conditions.iter_mut().collect();
        refs.extend(self.skip_if.iter_mut());
        if let NodeKind::If(spec) = &mut self.kind {
            refs.push(&mut spec.condition);
        }
        refs
    }

    /// Structural checks that do not need the rest of the graph.
    pub(crate) fn validate(&self) -> Result<(), NodeProblem> {
        if let Some(problem) = self.problems.first() {
            return Err(problem.clone());
        }
        match &self.kind {
            NodeKind::Execute(spec) if spec.detached && spec.on_error.is_some() => {
                Err(NodeProblem::DetachedWithOnError)
            }
            NodeKind::If(spec) if spec.then.is_none() => Err(NodeProblem::MissingThen),
            NodeKind::Repeat(spec) => match spec.interval {
                None => Err(NodeProblem::MissingInterval),
                Some(interval) if interval.period() <= Duration::zero() => {
                    Err(NodeProblem::InvalidInterval)
                }
                Some(_) => Ok(()),
            },
            NodeKind::Fork(spec) if spec.branches.is_empty() => {
                Err(NodeProblem::ForkWithoutBranches)
            }
            NodeKind::Form(spec) if spec.requirement.is_empty() => {
                Err(NodeProblem::GateWithoutTarget)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_second_next_is_recorded() {
        let node = Node::noop().next("a").next("b");
        assert_eq!(node.validate(), Err(NodeProblem::DuplicateNext));
    }

    #[test]
    fn test_fork_next_accumulates_branches() {
        let node = Node::fork().next("a").next("b");
        assert!(node.validate().is_ok());
        match &node.kind {
            NodeKind::Fork(spec) => assert_eq!(spec.branches.len(), 2),
            other => panic!("unexpected kind {}", other.label()),
        }
    }

    #[test]
    fn test_fork_without_branches_is_rejected() {
        assert_eq!(Node::fork().validate(), Err(NodeProblem::ForkWithoutBranches));
    }

    #[test]
    fn test_second_time_guard_is_recorded() {
        let node = Node::wait()
            .after_pausing_for(Duration::minutes(5))
            .after_waiting_until(|ctx| ctx.now);
        assert_eq!(node.validate(), Err(NodeProblem::DuplicateTimeGuard));
    }

    #[test]
    fn test_second_interval_is_recorded() {
        let node = Node::repeat().start_from("a").every_hour(1).every_n_minutes(5);
        assert_eq!(node.validate(), Err(NodeProblem::DuplicateInterval));
    }

    #[test]
    fn test_repeat_needs_interval() {
        assert_eq!(
            Node::repeat().start_from("a").validate(),
            Err(NodeProblem::MissingInterval)
        );
    }

    #[test]
    fn test_repeat_interval_must_be_positive() {
        assert_eq!(
            Node::repeat().start_from("a").every_n_minutes(0).validate(),
            Err(NodeProblem::InvalidInterval)
        );
    }

    #[test]
    fn test_if_needs_then() {
        let node = Node::branch(Condition::flag("x")).else_goto("b");
        assert_eq!(node.validate(), Err(NodeProblem::MissingThen));
        let node = Node::branch(Condition::flag("x")).then_goto("a").then_goto("b");
        assert_eq!(node.validate(), Err(NodeProblem::DuplicateClause("Then")));
    }

    #[test]
    fn test_detached_with_on_error_is_rejected() {
        let node = Node::execute("work").detached().on_error("handler");
        assert_eq!(node.validate(), Err(NodeProblem::DetachedWithOnError));
    }

    #[test]
    fn test_form_needs_target() {
        assert_eq!(Node::form("approve").validate(), Err(NodeProblem::GateWithoutTarget));
        assert!(Node::form("approve").permission("sign").validate().is_ok());
        assert_eq!(
            Node::form("approve").user("a").user("b").validate(),
            Err(NodeProblem::DuplicateRequirement("user"))
        );
    }

    #[test]
    fn test_modifier_on_wrong_kind() {
        assert_eq!(
            Node::end().arg(1).validate(),
            Err(NodeProblem::NotApplicable("arg"))
        );
        assert_eq!(
            Node::noop().user("alice").validate(),
            Err(NodeProblem::NotApplicable("user"))
        );
    }

    #[test]
    fn test_first_fire() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(
            Interval::minutes(30).first_fire(now),
            now + Duration::minutes(30)
        );
        assert_eq!(
            Interval::daily_at(10, 15).unwrap().first_fire(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap()
        );
        assert_eq!(
            Interval::daily_at(8, 0).unwrap().first_fire(now),
            Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap()
        );
    }
}
