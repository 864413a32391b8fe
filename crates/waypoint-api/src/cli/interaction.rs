//! Interaction gate subcommands: list open tasks and validate one.

use anyhow::{Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use waypoint_core::automation::{EngineError, RunOutcome, ValidateOutcome};
use waypoint_types::actor::{Actor, InteractionRequirement};

use super::{parse_data, parse_id, short_id};
use crate::state::AppState;

pub async fn handle_tasks(actor: &Actor, state: &AppState, json: bool) -> Result<()> {
    let steps = state
        .engine
        .open_steps_for(actor)
        .await
        .map_err(|e| anyhow!("Failed to list open tasks: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    if steps.is_empty() {
        println!();
        println!("  No open tasks for '{}'.", actor.id);
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step ID").fg(Color::Cyan),
            Cell::new("Automation"),
            Cell::new("Node"),
            Cell::new("Assigned To"),
            Cell::new("Waiting Since"),
        ]);

    for step in &steps {
        table.add_row(vec![
            Cell::new(step.id),
            Cell::new(short_id(&step.automation_id)),
            Cell::new(&step.node_name),
            Cell::new(describe_requirement(&step.interaction)),
            Cell::new(step.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn describe_requirement(requirement: &InteractionRequirement) -> String {
    let mut parts = Vec::new();
    if let Some(user) = &requirement.user {
        parts.push(format!("user:{user}"));
    }
    if let Some(group) = &requirement.group {
        parts.push(format!("group:{group}"));
    }
    parts.extend(requirement.permissions.iter().map(|p| format!("perm:{p}")));
    if parts.is_empty() {
        "anyone".to_string()
    } else {
        parts.join(", ")
    }
}

pub async fn handle_validate(
    step_id: &str,
    actor: &Actor,
    data: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let step_id = parse_id(step_id)?;
    let submitted = parse_data(data)?;

    let outcome = match state.engine.validate(&step_id, actor, submitted).await {
        Ok(outcome) => outcome,
        Err(EngineError::PermissionDenied) => {
            return Err(anyhow!("'{}' may not act on step {step_id}", actor.id));
        }
        Err(e) => return Err(anyhow!("Failed to validate step: {e}")),
    };

    let label = match outcome {
        ValidateOutcome::AlreadyCompleted => "already completed",
        ValidateOutcome::Resumed(RunOutcome::Finished) => "finished",
        ValidateOutcome::Resumed(RunOutcome::Suspended) => "suspended",
    };

    if json {
        let out = serde_json::json!({ "step_id": step_id.to_string(), "outcome": label });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    match outcome {
        ValidateOutcome::AlreadyCompleted => println!(
            "  {} Step {} was already completed",
            style("!").yellow().bold(),
            step_id
        ),
        ValidateOutcome::Resumed(_) => println!(
            "  {} Validated step {} (automation {})",
            style("*").green().bold(),
            step_id,
            label
        ),
    }
    println!();
    Ok(())
}
