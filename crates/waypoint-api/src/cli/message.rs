//! Message subcommands: point-to-point `send` and class-wide `broadcast`.

use anyhow::{Result, anyhow};
use console::style;
use serde_json::Value;

use super::parse_data;
use crate::state::AppState;

pub async fn handle_send(
    key: &str,
    message: &str,
    token: &str,
    data: Option<&str>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let payload = parse_data(data)?;
    let reply = state
        .engine
        .dispatch(key, message, token, &payload)
        .await
        .map_err(|e| anyhow!("Failed to send '{message}': {e}"))?;

    if json {
        let out = serde_json::json!({ "key": key, "message": message, "reply": reply });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    match reply {
        Some(reply) => println!(
            "  {} '{}' delivered to {}, reply: {}",
            style("*").green().bold(),
            style(message).cyan(),
            key,
            reply
        ),
        None => println!(
            "  {} '{}' was not received by {}",
            style("!").yellow().bold(),
            style(message).cyan(),
            key
        ),
    }
    println!();
    Ok(())
}

pub async fn handle_broadcast(
    class: &str,
    message: &str,
    token: &str,
    data: Option<&str>,
    create: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let payload = parse_data(data)?;
    let mut replies = state
        .engine
        .broadcast(class, message, token, &payload)
        .await
        .map_err(|e| anyhow!("Failed to broadcast '{message}': {e}"))?;

    let mut created = None;
    if create && replies.is_empty() {
        if let Some((automation, reply)) = state
            .engine
            .create_on_message(class, message, token, &payload)
            .await
            .map_err(|e| anyhow!("Failed to start '{class}' for '{message}': {e}"))?
        {
            replies.extend(reply);
            created = Some(automation.id());
        }
    }

    if json {
        let out = serde_json::json!({
            "class": class,
            "message": message,
            "replies": replies,
            "created": created.map(|id| id.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' broadcast to '{}': {} reply(ies)",
        style("*").green().bold(),
        style(message).cyan(),
        class,
        replies.len()
    );
    for reply in &replies {
        println!("    {}", format_reply(reply));
    }
    if let Some(id) = created {
        println!("  Started new automation {id}");
    }
    println!();
    Ok(())
}

fn format_reply(reply: &Value) -> String {
    match reply {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
