//! Built-in workflow definitions registered by `wpt`.
//!
//! - `onboarding`: provisions an account while IT approves equipment in
//!   parallel, waits for the badge, then notifies the heartbeat monitor.
//! - `heartbeat`: a singleton that beats every fifteen minutes and counts
//!   completed onboardings.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use waypoint_core::automation::{
    Action, ActionError, Condition, ConfigError, MessageTarget, Node, ParamType, RECEIVED,
    Receiver, Registry, StepContext, Uniqueness, WorkflowDefinition,
};

pub const ONBOARDING: &str = "onboarding";
pub const HEARTBEAT: &str = "heartbeat";

/// Message the onboarding workflow broadcasts when it completes.
pub const ONBOARDED: &str = "onboarded";

/// Register every built-in definition.
pub fn register_all(registry: &Registry) -> Result<(), ConfigError> {
    registry.register(onboarding()?);
    registry.register(heartbeat()?);
    Ok(())
}

// ---------------------------------------------------------------------------
// onboarding
// ---------------------------------------------------------------------------

pub fn onboarding() -> Result<Arc<WorkflowDefinition>, ConfigError> {
    WorkflowDefinition::builder(ONBOARDING)
        .verbose_name("Employee onboarding")
        .verbose_name_plural("Employee onboardings")
        .unique(Uniqueness::ByFields(vec!["email".to_string()]))
        .method("provision_account", Action::sync(provision_account))
        .receiver(
            "badge_printed",
            Receiver::sync(|ctx| {
                let badge = ctx.payload.get("badge_id").cloned().unwrap_or(Value::Null);
                ctx.data.set("badge", badge);
                Ok(RECEIVED)
            })
            .require("badge_id", ParamType::Str),
        )
        .node(
            "split",
            Node::fork()
                .next("provision")
                .next("equipment")
                .description("Provision the account and order equipment in parallel"),
        )
        .node("provision", Node::execute("provision_account").next("ready"))
        .node(
            "equipment",
            Node::form("equipment_request")
                .group("it")
                .permission("approve_equipment")
                .template("forms/equipment.html")
                .description("IT approves the equipment order")
                .next("ready"),
        )
        .node("ready", Node::join())
        .node(
            "badge",
            Node::wait()
                .as_soon_as(Condition::new(|ctx| {
                    ctx.get("badge").is_some_and(|badge| !badge.is_null())
                }))
                .skip_after(Duration::days(7))
                .description("Wait for facilities to print the badge"),
        )
        .node(
            "notify",
            Node::send_message(MessageTarget::class(HEARTBEAT), ONBOARDED, ONBOARDING)
                .description("Tell the heartbeat monitor"),
        )
        .node("done", Node::end())
        .build()
}

fn provision_account(ctx: &StepContext) -> Result<Value, ActionError> {
    let email = ctx
        .data
        .get("email")
        .and_then(|v| v.as_str().map(str::to_owned))
        .ok_or_else(|| ActionError::failed("onboarding requires an email"))?;
    let account = match email.split_once('@') {
        Some((local, _)) => local.to_string(),
        None => email.clone(),
    };

    ctx.data.set("account", account.clone());
    tracing::info!(automation_id = %ctx.automation_id, %account, "provisioned account");
    Ok(json!({ "account": account }))
}

// ---------------------------------------------------------------------------
// heartbeat
// ---------------------------------------------------------------------------

pub fn heartbeat() -> Result<Arc<WorkflowDefinition>, ConfigError> {
    WorkflowDefinition::builder(HEARTBEAT)
        .verbose_name("Heartbeat monitor")
        .unique(Uniqueness::Singleton)
        .receiver(
            ONBOARDED,
            Receiver::sync(|ctx| {
                let count = ctx.data.get_i64("onboarded").unwrap_or(0) + 1;
                ctx.data.set("onboarded", count);
                Ok(count)
            }),
        )
        .node(
            "beat",
            Node::execute(Action::sync(|ctx| {
                let beats = ctx.data.get_i64("beats").unwrap_or(0) + 1;
                ctx.data.set("beats", beats);
                ctx.data.set("last_beat", Utc::now().to_rfc3339());
                Ok(beats)
            })),
        )
        .node("again", Node::repeat().start_from("beat").every_n_minutes(15))
        .build()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use waypoint_core::automation::{Engine, RunOutcome, ValidateOutcome};
    use waypoint_core::repository::memory::InMemoryAutomationStore;
    use waypoint_types::actor::Actor;
    use waypoint_types::automation::AutomationData;
    use waypoint_types::config::EngineConfig;

    use super::*;

    fn data(value: Value) -> AutomationData {
        match value {
            Value::Object(map) => map,
            other => panic!("expected a JSON object, got {other}"),
        }
    }

    fn engine() -> Engine<InMemoryAutomationStore> {
        let registry = Registry::new();
        register_all(&registry).unwrap();
        Engine::new(InMemoryAutomationStore::new(), registry, EngineConfig::default())
    }

    fn it_admin() -> Actor {
        Actor::new("ivy")
            .with_group("it")
            .with_permission("approve_equipment")
    }

    #[test]
    fn test_definitions_build() {
        let registry = Registry::new();
        register_all(&registry).unwrap();
        assert_eq!(
            registry.classes(),
            [
                (HEARTBEAT.to_string(), "Heartbeat monitor".to_string()),
                (ONBOARDING.to_string(), "Employee onboarding".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_onboarding_suspends_at_equipment_gate() {
        let engine = engine();
        let onboarding = engine
            .start(ONBOARDING, data(json!({"email": "ada@example.com"})))
            .await
            .unwrap();

        let record = onboarding.record().await.unwrap();
        assert!(!record.finished);
        assert_eq!(record.data.get("account"), Some(&json!("ada")));

        let open = engine.open_steps_for(&it_admin()).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].node_name, "equipment");

        // Not in the IT group.
        assert!(engine.open_steps_for(&Actor::new("bob")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_onboarding_is_unique_per_email() {
        let engine = engine();
        let first = engine
            .start(ONBOARDING, data(json!({"email": "ada@example.com"})))
            .await
            .unwrap();
        let again = engine
            .create(ONBOARDING, data(json!({"email": "ada@example.com"})))
            .await
            .unwrap();
        let other = engine
            .create(ONBOARDING, data(json!({"email": "grace@example.com"})))
            .await
            .unwrap();

        assert_eq!(first.id(), again.id());
        assert_ne!(first.id(), other.id());
    }

    #[tokio::test]
    async fn test_onboarding_end_to_end_notifies_heartbeat() {
        let engine = engine();
        let heartbeat = engine.start(HEARTBEAT, AutomationData::new()).await.unwrap();
        assert_eq!(
            heartbeat.record().await.unwrap().data.get("beats"),
            Some(&json!(1))
        );

        let onboarding = engine
            .start(ONBOARDING, data(json!({"email": "ada@example.com"})))
            .await
            .unwrap();

        let gate = engine.open_steps_for(&it_admin()).await.unwrap().remove(0);
        let outcome = engine
            .validate(&gate.id, &it_admin(), data(json!({"laptop": "14-inch"})))
            .await
            .unwrap();
        // Joined, now waiting for the badge.
        assert_eq!(outcome, ValidateOutcome::Resumed(RunOutcome::Suspended));

        let reply = engine
            .dispatch(
                onboarding.unique_key(),
                "badge_printed",
                "facilities",
                &data(json!({"badge_id": "B-17"})),
            )
            .await
            .unwrap();
        assert_eq!(reply, Some(json!(RECEIVED)));

        assert_eq!(onboarding.run().await.unwrap(), RunOutcome::Finished);
        let record = onboarding.record().await.unwrap();
        assert!(record.finished);
        assert_eq!(record.data.get("badge"), Some(&json!("B-17")));

        let heartbeat = heartbeat.record().await.unwrap();
        assert!(!heartbeat.finished);
        assert_eq!(heartbeat.data.get("onboarded"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_badge_message_requires_badge_id() {
        let engine = engine();
        let onboarding = engine
            .start(ONBOARDING, data(json!({"email": "ada@example.com"})))
            .await
            .unwrap();

        let reply = engine
            .dispatch(onboarding.unique_key(), "badge_printed", "facilities", &AutomationData::new())
            .await
            .unwrap();
        assert_eq!(reply, None);
        assert!(
            !engine
                .satisfies_data_requirements(ONBOARDING, "badge_printed", None)
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_provision_without_email_finishes_instance() {
        let engine = engine();
        let onboarding = engine.start(ONBOARDING, AutomationData::new()).await.unwrap();

        assert!(onboarding.is_finished().await.unwrap());
        let failed = onboarding
            .steps()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.node_name == "provision")
            .unwrap();
        assert!(failed.message.contains("requires an email"));
    }
}
