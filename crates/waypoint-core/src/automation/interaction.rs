//! Interaction gate API.
//!
//! The collaborator that renders forms (a web view, the CLI) uses these
//! entry points to list the gates an actor may act on, bind a gate step to
//! its form, and validate it, which re-advances the automation from the gate.

use serde_json::Value;
use tracing::info;
use uuid::Uuid;
use waypoint_types::actor::{Actor, InteractionRequirement};
use waypoint_types::automation::AutomationData;
use waypoint_types::step::StepRecord;

use crate::repository::AutomationStore;

use super::advance::{RunOutcome, submitted_key, validated_key};
use super::engine::{Automation, Engine};
use super::error::EngineError;
use super::node::NodeKind;

/// What a form renderer needs to present a gate.
#[derive(Debug, Clone)]
pub struct GateView {
    pub automation_id: Uuid,
    pub automation_class: String,
    pub step: StepRecord,
    pub node: String,
    pub form: String,
    pub template: Option<String>,
    pub description: Option<String>,
    pub requirement: InteractionRequirement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateOutcome {
    /// The gate accepted the submission and the automation was re-advanced.
    Resumed(RunOutcome),
    /// The gate was already passed; nothing changed.
    AlreadyCompleted,
}

impl<S: AutomationStore + 'static> Engine<S> {
    /// Open interaction steps, across all classes, that `actor` may act on.
    pub async fn open_steps_for(&self, actor: &Actor) -> Result<Vec<StepRecord>, EngineError> {
        Ok(self
            .store()
            .list_open_interactions()
            .await?
            .into_iter()
            .filter(|step| step.interaction.admits(actor))
            .collect())
    }

    /// Load the automation owning an interaction step and describe its gate.
    pub async fn bind_step(&self, step_id: &Uuid) -> Result<(Automation<S>, GateView), EngineError> {
        let step = self
            .store()
            .get_step(step_id)
            .await?
            .ok_or(EngineError::StepNotFound(*step_id))?;
        let automation = self.load(&step.automation_id).await?;

        let definition = automation.definition();
        let node_id = definition.require_node(&step.node_name)?;
        let node = definition.node(node_id);
        let NodeKind::Form(spec) = &node.kind else {
            return Err(EngineError::NotAnInteraction(step.node_name.clone()));
        };

        let view = GateView {
            automation_id: automation.id(),
            automation_class: automation.class().to_string(),
            node: step.node_name.clone(),
            form: spec.form.clone(),
            template: spec.template.clone(),
            description: node.description.clone(),
            requirement: spec.requirement.clone(),
            step,
        };
        Ok((automation, view))
    }

    /// Submit a gate on behalf of `actor`.
    ///
    /// Stores the validation marker and the submitted data on the instance,
    /// then resumes the branch from the gate. Repeated submissions after the
    /// gate has been passed return [`ValidateOutcome::AlreadyCompleted`].
    pub async fn validate(
        &self,
        step_id: &Uuid,
        actor: &Actor,
        submitted: AutomationData,
    ) -> Result<ValidateOutcome, EngineError> {
        let (automation, view) = self.bind_step(step_id).await?;
        if view.step.is_finished() || automation.is_finished().await? {
            return Ok(ValidateOutcome::AlreadyCompleted);
        }
        if !view.requirement.admits(actor) {
            return Err(EngineError::PermissionDenied);
        }

        let marker = validated_key(&view.node);
        if automation.data().contains(&marker) {
            return Ok(ValidateOutcome::AlreadyCompleted);
        }
        automation.data().set(marker, actor.id.clone());
        automation
            .data()
            .set(submitted_key(&view.node), Value::Object(submitted));
        automation.save().await?;
        info!(
            automation_id = %view.automation_id,
            node = %view.node,
            actor = %actor.id,
            "interaction validated"
        );

        let outcome = automation
            .resume(view.step.previous_id, &view.node)
            .await?;
        Ok(ValidateOutcome::Resumed(outcome))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::automation::definition::WorkflowDefinition;
    use crate::automation::node::Node;
    use crate::automation::testing::{data, engine_with, node_names};
    use crate::repository::memory::InMemoryAutomationStore;

    fn approval() -> Arc<WorkflowDefinition> {
        WorkflowDefinition::builder("approval")
            .autorun(false)
            .node("prepare", Node::noop())
            .node(
                "approve",
                Node::form("approval_form")
                    .group("managers")
                    .permission("approve")
                    .template("forms/approve.html")
                    .description("Manager sign-off"),
            )
            .node("done", Node::end())
            .build()
            .unwrap()
    }

    fn manager() -> Actor {
        Actor::new("maria").with_group("managers").with_permission("approve")
    }

    async fn waiting_gate() -> (
        Engine<InMemoryAutomationStore>,
        Automation<InMemoryAutomationStore>,
        StepRecord,
    ) {
        let engine = engine_with([approval()]);
        let automation = engine.create("approval", AutomationData::new()).await.unwrap();
        assert_eq!(automation.run().await.unwrap(), RunOutcome::Suspended);
        let gate = automation
            .steps()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.node_name == "approve")
            .unwrap();
        (engine, automation, gate)
    }

    #[tokio::test]
    async fn test_gate_stamps_step_and_suspends() {
        let (_engine, _automation, gate) = waiting_gate().await;
        assert!(gate.requires_interaction);
        assert!(!gate.is_finished());
        assert!(!gate.is_locked());
        assert_eq!(gate.interaction.group.as_deref(), Some("managers"));
        assert_eq!(gate.interaction.permissions, ["approve"]);
    }

    #[tokio::test]
    async fn test_open_steps_for_filters_by_actor() {
        let (engine, _automation, gate) = waiting_gate().await;

        let mine = engine.open_steps_for(&manager()).await.unwrap();
        assert_eq!(mine.iter().map(|s| s.id).collect::<Vec<_>>(), [gate.id]);

        let outsider = Actor::new("olaf").with_permission("approve");
        assert!(engine.open_steps_for(&outsider).await.unwrap().is_empty());

        let root = Actor::new("root").superuser();
        assert_eq!(engine.open_steps_for(&root).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bind_step_describes_gate() {
        let (engine, automation, gate) = waiting_gate().await;
        let (bound, view) = engine.bind_step(&gate.id).await.unwrap();
        assert_eq!(bound.id(), automation.id());
        assert_eq!(view.form, "approval_form");
        assert_eq!(view.template.as_deref(), Some("forms/approve.html"));
        assert_eq!(view.description.as_deref(), Some("Manager sign-off"));

        let prepare = automation.steps().await.unwrap().remove(0);
        assert!(matches!(
            engine.bind_step(&prepare.id).await,
            Err(EngineError::NotAnInteraction(node)) if node == "prepare"
        ));
    }

    #[tokio::test]
    async fn test_validate_resumes_and_is_idempotent() {
        let (engine, automation, gate) = waiting_gate().await;

        let outcome = engine
            .validate(&gate.id, &manager(), data(json!({"approved": true})))
            .await
            .unwrap();
        assert_eq!(outcome, ValidateOutcome::Resumed(RunOutcome::Finished));

        let record = automation.record().await.unwrap();
        assert!(record.finished);
        assert_eq!(record.data.get("_approve_validated"), Some(&json!("maria")));
        assert_eq!(record.data.get("_approve_data"), Some(&json!({"approved": true})));
        assert_eq!(
            node_names(&automation.steps().await.unwrap()),
            ["prepare", "approve", "done"]
        );

        let again = engine
            .validate(&gate.id, &manager(), data(json!({"approved": false})))
            .await
            .unwrap();
        assert_eq!(again, ValidateOutcome::AlreadyCompleted);
        let record = automation.record().await.unwrap();
        assert_eq!(record.data.get("_approve_data"), Some(&json!({"approved": true})));
        assert_eq!(automation.steps().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_validate_rejects_unqualified_actor() {
        let (engine, automation, gate) = waiting_gate().await;
        let intern = Actor::new("ivan").with_group("managers");

        assert!(matches!(
            engine.validate(&gate.id, &intern, AutomationData::new()).await,
            Err(EngineError::PermissionDenied)
        ));
        assert!(!automation.record().await.unwrap().data.contains_key("_approve_validated"));
    }
}
