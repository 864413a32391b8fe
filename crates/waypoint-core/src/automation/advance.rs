//! The advancement loop.
//!
//! Each pass walks the graph from the instance's frontier (its unfinished
//! steps) and performs enter -> execute -> leave on every node until each
//! thread of advancement suspends or the instance finishes. State is
//! persisted after every step, so a pass may stop at any point and a later
//! pass (possibly in another process) continues where it left off.
//!
//! Fork branches are pushed onto a worklist and advanced one after another
//! within the same pass; there is no recursion and no engine-owned thread.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waypoint_types::step::StepRecord;

use crate::repository::AutomationStore;

use super::action::{Action, to_json};
use super::context::{GuardContext, StepContext};
use super::engine::Automation;
use super::error::{ConfigError, EngineError, NodeProblem};
use super::node::{
    Clause, ForkSpec, FormSpec, Interval, MessageTarget, Node, NodeId, NodeKind, SendSpec,
};
use super::reference::Ref;

/// How an advancement pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A terminal node ran, or an unhandled action error finished the instance.
    Finished,
    /// Every thread of advancement is waiting on time, data, input or siblings.
    Suspended,
}

/// Result of executing one entered step.
enum Executed {
    /// Still locked; leave it, optionally towards an overriding successor.
    Proceed(Option<NodeId>),
    /// The Fork step is sealed; advance each branch from it.
    Forked(StepRecord, Vec<NodeId>),
    /// The lock is released (or the step sealed); stop this thread.
    Suspend,
    /// The instance was finished by an unhandled action error.
    Halt,
}

type Frontier = VecDeque<(Option<StepRecord>, NodeId)>;

/// Persisted Repeat bookkeeping, stored under `_<node>_repeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepeatState {
    startpoint: DateTime<Utc>,
    next_fire: DateTime<Utc>,
}

pub(crate) fn validated_key(node: &str) -> String {
    format!("_{node}_validated")
}

pub(crate) fn submitted_key(node: &str) -> String {
    format!("_{node}_data")
}

fn repeat_key(node: &str) -> String {
    format!("_{node}_repeat")
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

impl<S: AutomationStore + 'static> Automation<S> {
    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Advance every open branch until it suspends or the instance finishes.
    ///
    /// Data is reloaded from the store first; unsaved changes on the handle
    /// are discarded.
    pub async fn run(&self) -> Result<RunOutcome, EngineError> {
        self.run_at(Utc::now()).await
    }

    /// [`Automation::run`] with an explicit clock.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunOutcome, EngineError> {
        self.begin(now).await?;

        let store = self.engine.store();
        let steps = store.list_steps(&self.id()).await?;
        let mut frontier = Frontier::new();

        if steps.is_empty() {
            frontier.push_back((None, self.definition.first_node()));
        } else {
            let by_id: HashMap<Uuid, &StepRecord> = steps.iter().map(|s| (s.id, s)).collect();
            for step in steps.iter().filter(|s| !s.is_finished()) {
                let node = self.definition.require_node(&step.node_name)?;
                let previous = match step.previous_id {
                    Some(id) => Some(*by_id.get(&id).ok_or(EngineError::StepNotFound(id))?),
                    None => None,
                };
                // A successor created just before its predecessor was sealed;
                // it is reached again when the predecessor is resumed.
                if previous.is_some_and(|p| !p.is_finished()) {
                    debug!(automation_id = %self.id(), step_id = %step.id, "skipping step behind an open predecessor");
                    continue;
                }
                frontier.push_back((previous.cloned(), node));
            }
            if frontier.is_empty() {
                warn!(automation_id = %self.id(), "unfinished automation has no open steps");
            }
        }

        self.drive(frontier, now).await
    }

    /// Advance a single branch: re-enter `node` as reached from `previous`.
    pub async fn resume(&self, previous: Option<Uuid>, node: &str) -> Result<RunOutcome, EngineError> {
        self.resume_at(previous, node, Utc::now()).await
    }

    pub async fn resume_at(
        &self,
        previous: Option<Uuid>,
        node: &str,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, EngineError> {
        self.begin(now).await?;
        let node = self.definition.require_node(node)?;
        let previous = match previous {
            Some(id) => Some(
                self.engine
                    .store()
                    .get_step(&id)
                    .await?
                    .ok_or(EngineError::StepNotFound(id))?,
            ),
            None => None,
        };
        self.drive(Frontier::from([(previous, node)]), now).await
    }

    /// Run on a background task so the caller is not blocked.
    pub fn nice(&self) -> tokio::task::JoinHandle<Result<RunOutcome, EngineError>> {
        let automation = self.clone();
        tokio::spawn(async move { automation.run().await })
    }

    async fn begin(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let record = self.record().await?;
        if record.finished {
            return Err(EngineError::AlreadyFinished(self.id()));
        }
        self.data.replace(record.data);
        self.halted.store(false, Ordering::SeqCst);
        self.engine.store().clear_elapsed_pause(&self.id(), now).await?;
        Ok(())
    }

    async fn drive(&self, mut frontier: Frontier, now: DateTime<Utc>) -> Result<RunOutcome, EngineError> {
        while let Some((mut previous, mut node)) = frontier.pop_front() {
            loop {
                if self.halted.load(Ordering::SeqCst) {
                    return Ok(RunOutcome::Finished);
                }
                let Some(step) = self.enter(previous.as_ref(), node).await? else {
                    break;
                };
                match self.execute(&step, node, now).await? {
                    Executed::Proceed(next) => match self.leave(step, node, next).await? {
                        Some((sealed, successor)) => {
                            previous = Some(sealed);
                            node = successor;
                        }
                        None => break,
                    },
                    Executed::Forked(sealed, branches) => {
                        for branch in branches {
                            frontier.push_back((Some(sealed.clone()), branch));
                        }
                        break;
                    }
                    Executed::Suspend => break,
                    Executed::Halt => return Ok(RunOutcome::Finished),
                }
            }
        }

        Ok(if self.halted.load(Ordering::SeqCst) {
            RunOutcome::Finished
        } else {
            RunOutcome::Suspended
        })
    }

    // -----------------------------------------------------------------------
    // enter / execute / leave
    // -----------------------------------------------------------------------

    /// Get or create the step for `node` reached from `previous` and lock it.
    /// `None` when another advancer holds it or it was already sealed.
    async fn enter(&self, previous: Option<&StepRecord>, node: NodeId) -> Result<Option<StepRecord>, EngineError> {
        let name = self.definition.node_name(node);
        if let Some(prev) = previous {
            if !prev.is_finished() {
                return Err(EngineError::Inconsistent(format!(
                    "node '{name}' entered from unfinished step {}",
                    prev.id
                )));
            }
        }

        let store = self.engine.store();
        let Some(step) = store
            .enter_step(&self.id(), previous.map(|p| &p.id), name)
            .await?
        else {
            debug!(automation_id = %self.id(), node = name, "step held by another advancer");
            return Ok(None);
        };
        if step.is_finished() {
            store.release_step(&step.id).await?;
            debug!(automation_id = %self.id(), node = name, step_id = %step.id, "step already sealed");
            return Ok(None);
        }

        debug!(automation_id = %self.id(), node = name, step_id = %step.id, "entered step");
        Ok(Some(step))
    }

    async fn execute(&self, step: &StepRecord, node: NodeId, now: DateTime<Utc>) -> Result<Executed, EngineError> {
        let spec = self.definition.node(node);
        let name = self.definition.node_name(node);
        let store = self.engine.store();
        let data = self.data.snapshot();
        let guard = GuardContext {
            automation_id: self.id(),
            step,
            data: &data,
            now,
        };

        if self.should_skip(spec, node, &guard)? {
            store.record_outcome(&step.id, "skipped", &Value::Null).await?;
            debug!(automation_id = %self.id(), node = name, "skipped");
            return Ok(Executed::Proceed(None));
        }

        if let Some(wait) = &spec.wait {
            let wake = wait.wake_time(&guard);
            if wake > now {
                store.lower_paused_until(&self.id(), wake).await?;
                store.release_step(&step.id).await?;
                debug!(automation_id = %self.id(), node = name, wake = %wake, "waiting for time");
                return Ok(Executed::Suspend);
            }
        }

        for condition in &spec.conditions {
            if !self.resolved(node, condition)?.check(&guard) {
                store.release_step(&step.id).await?;
                debug!(automation_id = %self.id(), node = name, "waiting for condition");
                return Ok(Executed::Suspend);
            }
        }

        match &spec.kind {
            NodeKind::Wait => Ok(Executed::Proceed(None)),
            NodeKind::Execute(exec) => {
                self.perform(
                    step,
                    node,
                    exec.callable.as_ref(),
                    &exec.args,
                    exec.detached,
                    exec.on_error.as_ref(),
                )
                .await
            }
            NodeKind::If(branch) => {
                let holds = self.resolved(node, &branch.condition)?.check(&guard);
                let clause = if holds { branch.then.as_ref() } else { branch.otherwise.as_ref() };
                debug!(automation_id = %self.id(), node = name, holds, "evaluated branch");
                match clause {
                    None => Ok(Executed::Proceed(None)),
                    Some(Clause::Goto(target)) => Ok(Executed::Proceed(Some(*self.resolved(node, target)?))),
                    Some(Clause::Run(action)) => {
                        self.perform(step, node, Some(action), &[], false, branch.on_error.as_ref())
                            .await
                    }
                }
            }
            NodeKind::Repeat(repeat) => match repeat.interval {
                Some(interval) => self.repeat(step, node, interval, now).await,
                None => Err(ConfigError::node(name, NodeProblem::MissingInterval).into()),
            },
            NodeKind::Fork(fork) => self.fork(step, node, fork).await,
            NodeKind::Join => self.join(step, node).await,
            NodeKind::Form(form) => self.form(step, node, form).await,
            NodeKind::SendMessage(send) => self.send(step, send).await,
            NodeKind::End => {
                store.set_finished(&self.id()).await?;
                self.halted.store(true, Ordering::SeqCst);
                info!(automation_id = %self.id(), node = name, "automation finished");
                Ok(Executed::Proceed(None))
            }
        }
    }

    /// Seal the step and return it together with its successor. The
    /// successor step is created before the current one is sealed so the
    /// frontier is never empty between the two writes.
    async fn leave(
        &self,
        step: StepRecord,
        node: NodeId,
        next: Option<NodeId>,
    ) -> Result<Option<(StepRecord, NodeId)>, EngineError> {
        let store = self.engine.store();
        if self.definition.node(node).is_end() {
            store.finish_step(&step.id).await?;
            return Ok(None);
        }

        let successor = match next.map(Ok).unwrap_or_else(|| self.definition.successor(node)) {
            Ok(successor) => successor,
            Err(err) => {
                store.finish_step(&step.id).await?;
                return Err(err.into());
            }
        };

        let successor_name = self.definition.node_name(successor);
        store
            .create_step(&self.id(), Some(&step.id), successor_name)
            .await?;
        let sealed = store.finish_step(&step.id).await?;
        self.save().await?;

        debug!(
            automation_id = %self.id(),
            node = self.definition.node_name(node),
            next = successor_name,
            step_id = %sealed.id,
            "left step"
        );
        Ok(Some((sealed, successor)))
    }

    // -----------------------------------------------------------------------
    // Node kinds
    // -----------------------------------------------------------------------

    fn should_skip(&self, spec: &Node, node: NodeId, guard: &GuardContext<'_>) -> Result<bool, EngineError> {
        if let Some(condition) = &spec.skip_if {
            if self.resolved(node, condition)?.check(guard) {
                return Ok(true);
            }
        }
        Ok(spec
            .skip_after
            .is_some_and(|age| guard.step.created_at + age < guard.now))
    }

    /// Run an action for an Execute node or an inline If clause.
    async fn perform(
        &self,
        step: &StepRecord,
        node: NodeId,
        action: Option<&Ref<Action>>,
        args: &[Value],
        detached: bool,
        on_error: Option<&Ref<NodeId>>,
    ) -> Result<Executed, EngineError> {
        let Some(action) = action else {
            return Ok(Executed::Proceed(None));
        };
        let action = self.resolved(node, action)?.clone();
        let name = self.definition.node_name(node);
        let store = self.engine.store();
        let max_len = self.engine.config().max_field_length;
        let ctx = StepContext {
            automation_id: self.id(),
            automation_class: self.class().to_string(),
            node: name.to_string(),
            step: step.clone(),
            args: args.to_vec(),
            data: self.data.clone(),
        };

        if detached && self.engine.config().detached_actions {
            let engine = self.engine.clone();
            let data = self.data.clone();
            let automation_id = self.id();
            let step_id = step.id;
            tokio::spawn(async move {
                let (message, result) = match action.call_contained(ctx).await {
                    Ok(value) => ("OK".to_string(), value),
                    Err(err) => {
                        warn!(automation_id = %automation_id, step_id = %step_id, error = %err, "detached action failed");
                        (truncate(&err.to_string(), max_len), json!({ "error": format!("{err:?}") }))
                    }
                };
                if let Err(e) = engine.store().record_outcome(&step_id, &message, &result).await {
                    warn!(step_id = %step_id, error = %e, "failed to record detached outcome");
                }
                if let Err(e) = engine.store().save_data(&automation_id, &data.snapshot()).await {
                    warn!(automation_id = %automation_id, error = %e, "failed to save data after detached action");
                }
            });
            debug!(automation_id = %self.id(), node = name, "spawned detached action");
            return Ok(Executed::Proceed(None));
        }

        match action.call_contained(ctx).await {
            Ok(value) => {
                store.record_outcome(&step.id, "OK", &value).await?;
                self.save().await?;
                Ok(Executed::Proceed(None))
            }
            Err(err) => {
                let message = truncate(&err.to_string(), max_len);
                let result = json!({ "error": format!("{err:?}") });
                store.record_outcome(&step.id, &message, &result).await?;
                self.save().await?;
                warn!(automation_id = %self.id(), node = name, error = %err, "action failed");

                match on_error {
                    Some(target) => Ok(Executed::Proceed(Some(*self.resolved(node, target)?))),
                    None => {
                        store.finish_step(&step.id).await?;
                        store.set_finished(&self.id()).await?;
                        self.halted.store(true, Ordering::SeqCst);
                        warn!(automation_id = %self.id(), node = name, "no error handler, automation finished");
                        Ok(Executed::Halt)
                    }
                }
            }
        }
    }

    /// Fire at most once per elapsed interval; after downtime the schedule
    /// skips ahead to the next future fire time instead of replaying.
    async fn repeat(
        &self,
        step: &StepRecord,
        node: NodeId,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> Result<Executed, EngineError> {
        let name = self.definition.node_name(node);
        let key = repeat_key(name);
        let store = self.engine.store();

        let mut state = self
            .data
            .get(&key)
            .and_then(|v| serde_json::from_value::<RepeatState>(v).ok())
            .unwrap_or_else(|| RepeatState {
                startpoint: now,
                next_fire: interval.first_fire(now),
            });

        if now < state.next_fire {
            self.data.set(key, to_json(&state));
            self.save().await?;
            store.lower_paused_until(&self.id(), state.next_fire).await?;
            store.release_step(&step.id).await?;
            debug!(automation_id = %self.id(), node = name, next_fire = %state.next_fire, "repeat waiting");
            return Ok(Executed::Suspend);
        }

        let period = interval.period();
        while state.next_fire <= now {
            state.next_fire = state.next_fire + period;
        }
        self.data.set(key, to_json(&state));
        self.save().await?;
        debug!(automation_id = %self.id(), node = name, next_fire = %state.next_fire, "repeat fired");
        Ok(Executed::Proceed(None))
    }

    async fn fork(&self, step: &StepRecord, node: NodeId, spec: &ForkSpec) -> Result<Executed, EngineError> {
        let store = self.engine.store();
        let mut branches = Vec::with_capacity(spec.branches.len());
        for branch in &spec.branches {
            let target = *self.resolved(node, branch)?;
            store
                .create_step(&self.id(), Some(&step.id), self.definition.node_name(target))
                .await?;
            branches.push(target);
        }
        let sealed = store.finish_step(&step.id).await?;
        self.save().await?;
        debug!(
            automation_id = %self.id(),
            node = self.definition.node_name(node),
            branches = branches.len(),
            "forked"
        );
        Ok(Executed::Forked(sealed, branches))
    }

    /// Barrier: proceed only when this is the last open branch of its Fork.
    /// Waiting occurrences seal themselves so exactly one occurrence passes.
    async fn join(&self, step: &StepRecord, node: NodeId) -> Result<Executed, EngineError> {
        let name = self.definition.node_name(node);
        let store = self.engine.store();

        let steps = store.list_steps(&self.id()).await?;
        let anchor = self
            .find_anchor(step, &index(&steps))
            .ok_or_else(|| ConfigError::node(name, NodeProblem::JoinWithoutFork))?;

        let lock = self.engine.join_lock(self.id(), anchor);
        let _guard = lock.lock().await;

        let steps = store.list_steps(&self.id()).await?;
        let by_id = index(&steps);
        let open = steps
            .iter()
            .filter(|s| !s.is_finished())
            .filter(|s| descends_from(s, anchor, &by_id))
            .count();

        if open > 1 {
            store.finish_step(&step.id).await?;
            debug!(automation_id = %self.id(), node = name, open, "join waiting for siblings");
            return Ok(Executed::Suspend);
        }

        self.engine.forget_join_lock(self.id(), anchor);
        debug!(automation_id = %self.id(), node = name, anchor = %anchor, "join complete");
        Ok(Executed::Proceed(None))
    }

    /// Nearest Fork ancestor not already closed by a Join on the path.
    fn find_anchor(&self, step: &StepRecord, by_id: &HashMap<Uuid, &StepRecord>) -> Option<Uuid> {
        let mut depth = 0usize;
        let mut cursor = step.previous_id;
        while let Some(id) = cursor {
            let current = by_id.get(&id)?;
            match self.definition.kind_of(&current.node_name) {
                Some(NodeKind::Join) => depth += 1,
                Some(NodeKind::Fork(_)) if depth == 0 => return Some(current.id),
                Some(NodeKind::Fork(_)) => depth -= 1,
                _ => {}
            }
            cursor = current.previous_id;
        }
        None
    }

    async fn form(&self, step: &StepRecord, node: NodeId, spec: &FormSpec) -> Result<Executed, EngineError> {
        let name = self.definition.node_name(node);
        let store = self.engine.store();

        if !step.requires_interaction {
            let mut stamped = step.clone();
            stamped.requires_interaction = true;
            stamped.interaction = spec.requirement.clone();
            store.mark_interaction(&stamped).await?;
        }

        if self.data.contains(&validated_key(name)) {
            debug!(automation_id = %self.id(), node = name, "interaction validated");
            return Ok(Executed::Proceed(None));
        }

        store.release_step(&step.id).await?;
        debug!(automation_id = %self.id(), node = name, form = %spec.form, "awaiting interaction");
        Ok(Executed::Suspend)
    }

    async fn send(&self, step: &StepRecord, spec: &SendSpec) -> Result<Executed, EngineError> {
        let payload = spec.payload.clone().unwrap_or_default();
        let replies: Vec<Value> = match &spec.target {
            MessageTarget::Class(class) => {
                self.engine
                    .broadcast_excluding(Some(self.id()), class, &spec.message, &spec.token, &payload)
                    .await?
            }
            MessageTarget::Key(key) => {
                let reply = if key == self.unique_key() || *key == self.id().to_string() {
                    self.receive(&spec.message, &spec.token, &payload).await?
                } else {
                    self.engine
                        .dispatch(key, &spec.message, &spec.token, &payload)
                        .await?
                };
                reply.into_iter().collect()
            }
        };

        self.engine
            .store()
            .record_outcome(&step.id, "OK", &Value::Array(replies))
            .await?;
        Ok(Executed::Proceed(None))
    }

    fn resolved<'a, T>(&self, node: NodeId, reference: &'a Ref<T>) -> Result<&'a T, EngineError> {
        reference.get().map_err(|problem| {
            EngineError::from(ConfigError::node(self.definition.node_name(node), problem))
        })
    }
}

fn index(steps: &[StepRecord]) -> HashMap<Uuid, &StepRecord> {
    steps.iter().map(|s| (s.id, s)).collect()
}

/// Whether `anchor` lies on the `previous` chain of `step`.
fn descends_from(step: &StepRecord, anchor: Uuid, by_id: &HashMap<Uuid, &StepRecord>) -> bool {
    let mut cursor = step.previous_id;
    while let Some(id) = cursor {
        if id == anchor {
            return true;
        }
        cursor = by_id.get(&id).and_then(|s| s.previous_id);
    }
    false
}
