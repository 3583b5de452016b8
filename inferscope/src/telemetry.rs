//! Telemetry initialization: structured logging via `tracing`.
//!
//! Log filtering follows the standard `RUST_LOG` environment variable and
//! defaults to `info`. The engine itself only emits spans and events;
//! exporting them anywhere (OTLP or otherwise) is the embedding service's
//! concern.

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subscriber with env-filtered console output.
///
/// Safe to call from binaries embedding the engine; returns an error if a
/// global subscriber is already installed.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Telemetry initialized");
    Ok(())
}
