//! Automation lifecycle subcommands: classes, start, list, steps, kill, prune.

use anyhow::{Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use waypoint_core::repository::AutomationStore;
use waypoint_types::step::StepRecord;

use super::{parse_data, parse_id, short_id};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

pub fn handle_classes(state: &AppState, json: bool) -> Result<()> {
    let classes = state.engine.registry().classes();

    if json {
        let out: Vec<_> = classes
            .iter()
            .map(|(class, name)| serde_json::json!({ "class": class, "verbose_name": name }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Class").fg(Color::Cyan), Cell::new("Name")]);
    for (class, name) in &classes {
        table.add_row(vec![Cell::new(class), Cell::new(name)]);
    }

    println!();
    println!("{table}");
    println!(
        "  Data directory: {}",
        style(state.data_dir.display()).dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

pub async fn handle_start(class: &str, data: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let data = parse_data(data)?;
    let automation = state
        .engine
        .start(class, data)
        .await
        .map_err(|e| anyhow!("Failed to start '{class}': {e}"))?;
    let record = automation
        .record()
        .await
        .map_err(|e| anyhow!("Failed to reload automation: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Started '{}'",
        style("*").green().bold(),
        style(class).cyan()
    );
    println!("  ID: {}", record.id);
    println!("  Key: {}", record.unique_key);
    println!("  Status: {}", status_label(record.finished, record.paused_until.is_some()));
    println!();
    println!(
        "  Inspect steps: {}",
        style(format!("wpt steps {}", record.id)).dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(class: Option<&str>, all: bool, state: &AppState, json: bool) -> Result<()> {
    let records = state
        .engine
        .store()
        .list_automations(class, !all)
        .await
        .map_err(|e| anyhow!("Failed to list automations: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No automations found.");
        println!(
            "  Start one with: {}",
            style("wpt start <class> --data '{...}'").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Class"),
            Cell::new("Status"),
            Cell::new("Paused Until"),
            Cell::new("Updated"),
        ]);

    for record in &records {
        let status = status_label(record.finished, record.paused_until.is_some());
        let status_cell = match status {
            "finished" => Cell::new(status).fg(Color::DarkGrey),
            "paused" => Cell::new(status).fg(Color::Yellow),
            _ => Cell::new(status).fg(Color::Green),
        };
        table.add_row(vec![
            Cell::new(short_id(&record.id)),
            Cell::new(&record.automation_class),
            status_cell,
            Cell::new(
                record
                    .paused_until
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(record.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn status_label(finished: bool, paused: bool) -> &'static str {
    if finished {
        "finished"
    } else if paused {
        "paused"
    } else {
        "active"
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

pub async fn handle_steps(target: &str, state: &AppState, json: bool) -> Result<()> {
    let automation = state
        .engine
        .find(target)
        .await
        .map_err(|e| anyhow!("Failed to look up automation: {e}"))?
        .ok_or_else(|| anyhow!("Automation '{target}' not found"))?;
    let steps = automation
        .steps()
        .await
        .map_err(|e| anyhow!("Failed to list steps: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({})",
        style("Automation").bold(),
        automation.id(),
        style(automation.class()).cyan()
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Node"),
            Cell::new("From"),
            Cell::new("State"),
            Cell::new("Message"),
        ]);

    for step in &steps {
        table.add_row(vec![
            Cell::new(short_id(&step.id)),
            Cell::new(&step.node_name),
            Cell::new(step.previous_id.as_ref().map(short_id).unwrap_or_else(|| "-".into())),
            step_state_cell(step),
            Cell::new(&step.message),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

fn step_state_cell(step: &StepRecord) -> Cell {
    if step.is_finished() {
        Cell::new("done").fg(Color::DarkGrey)
    } else if step.is_locked() {
        Cell::new("running").fg(Color::Green)
    } else if step.requires_interaction {
        Cell::new("awaiting input").fg(Color::Magenta)
    } else {
        Cell::new("waiting").fg(Color::Yellow)
    }
}

// ---------------------------------------------------------------------------
// Kill / prune
// ---------------------------------------------------------------------------

pub async fn handle_kill(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let existed = state
        .engine
        .kill(&id)
        .await
        .map_err(|e| anyhow!("Failed to kill automation: {e}"))?;

    if json {
        let out = serde_json::json!({ "id": id.to_string(), "deleted": existed });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if existed {
        println!();
        println!("  {} Killed automation {}", style("*").green().bold(), id);
        println!();
    } else {
        println!();
        println!("  {} No automation {}", style("!").yellow().bold(), id);
        println!();
    }
    Ok(())
}

pub async fn handle_prune(days: Option<u32>, state: &AppState, json: bool) -> Result<()> {
    let (automations, steps) = state
        .engine
        .delete_history(days)
        .await
        .map_err(|e| anyhow!("Failed to delete history: {e}"))?;

    if json {
        let out = serde_json::json!({ "automations": automations, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Deleted {} finished automation(s) and {} step(s)",
        style("*").green().bold(),
        automations,
        steps
    );
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_label() {
        assert_eq!(status_label(true, true), "finished");
        assert_eq!(status_label(false, true), "paused");
        assert_eq!(status_label(false, false), "active");
    }
}
