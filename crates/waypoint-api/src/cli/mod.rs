//! CLI command definitions and dispatch for the `wpt` binary.
//!
//! Uses clap derive macros for argument parsing. Commands operate on the
//! automation store under the data directory.

pub mod automation;
pub mod driver;
pub mod interaction;
pub mod message;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;
use waypoint_types::actor::Actor;
use waypoint_types::automation::AutomationData;

use crate::state::AppState;

/// Drive durable workflow automations.
#[derive(Parser)]
#[command(name = "wpt", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "WAYPOINT_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered workflow classes.
    Classes,

    /// Create an automation and run it if its class autoruns.
    Start {
        /// Workflow class name.
        class: String,

        /// Initial data as a JSON object.
        #[arg(long)]
        data: Option<String>,
    },

    /// List automations.
    #[command(alias = "ls")]
    List {
        /// Only automations of this class.
        #[arg(long)]
        class: Option<String>,

        /// Include finished automations.
        #[arg(long)]
        all: bool,
    },

    /// Show the step history of an automation (by id or unique key).
    Steps {
        /// Automation id or unique key.
        target: String,
    },

    /// Delete an automation and its steps.
    Kill {
        /// Automation id.
        id: String,
    },

    /// Delete finished automations older than the history window.
    Prune {
        /// Age in days (defaults to `history_days` from config.toml).
        #[arg(long)]
        days: Option<u32>,
    },

    /// Advance every runnable automation once.
    Tick,

    /// Advance runnable automations periodically until interrupted.
    Run {
        /// Seconds between ticks (defaults to `tick_interval_secs`).
        #[arg(long)]
        interval: Option<u64>,
    },

    /// List open interaction steps an actor may act on.
    Tasks {
        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Submit an interaction step on behalf of an actor.
    Validate {
        /// Interaction step id.
        step_id: String,

        #[command(flatten)]
        actor: ActorArgs,

        /// Submitted form data as a JSON object.
        #[arg(long)]
        data: Option<String>,
    },

    /// Send a message to one automation (by id or unique key).
    Send {
        /// Automation id or unique key.
        key: String,

        /// Message name.
        message: String,

        /// Token passed to the receiver.
        #[arg(long, default_value = "")]
        token: String,

        /// Message payload as a JSON object.
        #[arg(long)]
        data: Option<String>,
    },

    /// Send a message to every unfinished automation of a class.
    Broadcast {
        /// Workflow class name.
        class: String,

        /// Message name.
        message: String,

        /// Token passed to the receivers.
        #[arg(long, default_value = "")]
        token: String,

        /// Message payload as a JSON object.
        #[arg(long)]
        data: Option<String>,

        /// Start a new automation when the payload satisfies the class's
        /// receiver and no instance answered.
        #[arg(long)]
        create: bool,
    },
}

/// Identity used for interaction gates.
#[derive(Args, Debug, Clone)]
pub struct ActorArgs {
    /// User id acting on the step.
    #[arg(long)]
    pub user: String,

    /// Group membership (repeatable).
    #[arg(long = "group")]
    pub groups: Vec<String>,

    /// Held permission (repeatable).
    #[arg(long = "permission")]
    pub permissions: Vec<String>,

    /// Act as a superuser.
    #[arg(long)]
    pub superuser: bool,
}

impl ActorArgs {
    pub fn to_actor(&self) -> Actor {
        let mut actor = Actor::new(&self.user);
        for group in &self.groups {
            actor = actor.with_group(group);
        }
        for permission in &self.permissions {
            actor = actor.with_permission(permission);
        }
        if self.superuser {
            actor = actor.superuser();
        }
        actor
    }
}

/// Route a parsed command to its handler.
pub async fn dispatch(command: Commands, state: &AppState, json: bool) -> Result<()> {
    match command {
        Commands::Classes => automation::handle_classes(state, json),
        Commands::Start { class, data } => {
            automation::handle_start(&class, data.as_deref(), state, json).await
        }
        Commands::List { class, all } => {
            automation::handle_list(class.as_deref(), all, state, json).await
        }
        Commands::Steps { target } => automation::handle_steps(&target, state, json).await,
        Commands::Kill { id } => automation::handle_kill(&id, state, json).await,
        Commands::Prune { days } => automation::handle_prune(days, state, json).await,
        Commands::Tick => driver::handle_tick(state, json).await,
        Commands::Run { interval } => driver::handle_run(interval, state, json).await,
        Commands::Tasks { actor } => interaction::handle_tasks(&actor.to_actor(), state, json).await,
        Commands::Validate {
            step_id,
            actor,
            data,
        } => {
            interaction::handle_validate(&step_id, &actor.to_actor(), data.as_deref(), state, json)
                .await
        }
        Commands::Send {
            key,
            message,
            token,
            data,
        } => message::handle_send(&key, &message, &token, data.as_deref(), state, json).await,
        Commands::Broadcast {
            class,
            message,
            token,
            data,
            create,
        } => {
            message::handle_broadcast(&class, &message, &token, data.as_deref(), create, state, json)
                .await
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a `--data` argument. Absent means an empty object.
pub fn parse_data(raw: Option<&str>) -> Result<AutomationData> {
    let Some(raw) = raw else {
        return Ok(AutomationData::new());
    };
    let value: Value = serde_json::from_str(raw).context("Invalid JSON data")?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("Data must be a JSON object, got: {other}"),
    }
}

pub fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid id: {raw}"))
}

/// First eight characters of an id, for tables.
pub fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data() {
        assert!(parse_data(None).unwrap().is_empty());
        let data = parse_data(Some(r#"{"email": "ada@example.com"}"#)).unwrap();
        assert_eq!(data.get("email"), Some(&Value::from("ada@example.com")));
    }

    #[test]
    fn test_parse_data_rejects_non_objects() {
        assert!(parse_data(Some("[1, 2]")).is_err());
        assert!(parse_data(Some("{not json")).is_err());
    }

    #[test]
    fn test_short_id() {
        let id = Uuid::parse_str("0192f0c1-7a2b-7c3d-8e4f-5a6b7c8d9e0f").unwrap();
        assert_eq!(short_id(&id), "0192f0c1");
    }

    #[test]
    fn test_cli_parses_validate_with_actor() {
        let cli = Cli::try_parse_from([
            "wpt",
            "validate",
            "0192f0c1-7a2b-7c3d-8e4f-5a6b7c8d9e0f",
            "--user",
            "ivy",
            "--group",
            "it",
            "--permission",
            "approve_equipment",
            "--data",
            "{}",
        ])
        .unwrap();

        let Commands::Validate { actor, data, .. } = cli.command else {
            panic!("expected validate");
        };
        let actor = actor.to_actor();
        assert_eq!(actor.id, "ivy");
        assert_eq!(actor.groups, ["it"]);
        assert_eq!(actor.permissions, ["approve_equipment"]);
        assert!(!actor.is_superuser);
        assert_eq!(data.as_deref(), Some("{}"));
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from(["wpt", "list", "--all", "-vv", "--json"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::List { class: None, all: true }));
    }

    #[test]
    fn test_cli_tasks_requires_user() {
        assert!(Cli::try_parse_from(["wpt", "tasks"]).is_err());
    }
}
