//! Global subscriber for the `wpt` binary: an `EnvFilter`, a fmt layer,
//! and an optional OpenTelemetry bridge for the driver's `advance` spans.
//!
//! # Usage
//!
//! ```no_run
//! // Structured logging only, warnings and above unless RUST_LOG says otherwise
//! waypoint_observe::tracing_setup::init_tracing("warn", false).unwrap();
//!
//! // Also print closed spans as OpenTelemetry JSON on stdout
//! waypoint_observe::tracing_setup::init_tracing("info,waypoint=debug", true).unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use std::sync::OnceLock;

/// Set once OTel export is enabled; read by [`shutdown_tracing`].
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Build the filter: `RUST_LOG` when set and valid, else `default_filter`.
pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber.
///
/// The fmt layer logs every closed `advance` span with its busy and idle
/// time. With `enable_otel` the same spans are exported through
/// `opentelemetry-stdout` under the tracer name `waypoint`.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(default_filter: &str, enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_span_events(FmtSpan::CLOSE);

    let env_filter = env_filter(default_filter);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("waypoint");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Flush exported spans. Does nothing unless OTel export was enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("warning: failed to flush OpenTelemetry spans: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_env_filter_falls_back_to_default() {
        // SAFETY: This test is single-threaded and only removes the variable.
        unsafe {
            std::env::remove_var("RUST_LOG");
        }
        let filter = env_filter("info,waypoint=debug");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_shutdown_without_init_is_noop() {
        shutdown_tracing();
    }
}
