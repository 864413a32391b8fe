//! Waypoint command-line driver.
//!
//! Binary name: `wpt`
//!
//! Parses CLI arguments, opens the automation database, registers the
//! built-in workflow definitions, then dispatches to the command handler.

mod cli;
mod demos;
mod state;

use clap::Parser;

use cli::Cli;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity; RUST_LOG overrides it.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,waypoint=debug",
        _ => "trace",
    };
    waypoint_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init().await?;
    let result = cli::dispatch(cli.command, &state, cli.json).await;

    waypoint_observe::tracing_setup::shutdown_tracing();
    result
}
