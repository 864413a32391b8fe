//! Periodic driver subcommands: a single `tick` and the long-running `run`.

use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio_util::sync::CancellationToken;
use waypoint_core::automation::{TickReport, Ticker};

use crate::state::AppState;

pub async fn handle_tick(state: &AppState, json: bool) -> Result<()> {
    let report = state
        .engine
        .tick(Utc::now())
        .await
        .map_err(|e| anyhow!("Tick failed: {e}"))?;

    if json {
        let failed: Vec<_> = report
            .failed
            .iter()
            .map(|(id, err)| serde_json::json!({ "id": id.to_string(), "error": err }))
            .collect();
        let out = serde_json::json!({
            "examined": report.examined,
            "advanced": report.advanced,
            "finished": report.finished,
            "skipped": report.skipped,
            "failed": failed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_report(&report);
    Ok(())
}

fn print_report(report: &TickReport) {
    println!();
    println!(
        "  {} Examined {} automation(s): {} advanced, {} finished, {} skipped",
        style("*").green().bold(),
        report.examined,
        report.advanced,
        report.finished,
        report.skipped
    );

    if !report.failed.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Failed Automation").fg(Color::Red),
                Cell::new("Error"),
            ]);
        for (id, err) in &report.failed {
            table.add_row(vec![Cell::new(id), Cell::new(err)]);
        }
        println!();
        println!("{table}");
    }
    println!();
}

/// Tick until Ctrl+C or SIGTERM.
pub async fn handle_run(interval: Option<u64>, state: &AppState, json: bool) -> Result<()> {
    let mut ticker = Ticker::new(state.engine.clone());
    if let Some(secs) = interval {
        ticker = ticker.with_interval(Duration::from_secs(secs.max(1)));
    }

    if !json {
        println!();
        println!(
            "  {} Driving automations every {}s (Ctrl+C to stop)",
            style("*").green().bold(),
            ticker.interval().as_secs()
        );
        println!();
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));
    let ticks = ticker.run(cancel).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "ticks": ticks }))?);
    } else {
        println!();
        println!("  Stopped after {ticks} tick(s).");
        println!();
    }
    Ok(())
}

async fn cancel_on_shutdown(cancel: CancellationToken) {
    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping driver");
    cancel.cancel();
}

/// Wait for Ctrl+C or SIGTERM. A handler that cannot be installed never
/// resolves, leaving the other one in charge.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
