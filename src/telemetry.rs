use crate::config::TelemetryConfig;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging.
///
/// - `EnvFilter` for dynamic log levels (`RUST_LOG`).
/// - compact `fmt` output, or one JSON object per line with `json_logs`.
///
/// Metrics are recorded through the `metrics` facade; without an installed
/// recorder they are no-ops.
pub fn init(config: &TelemetryConfig) {
    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,workflow_monitor=debug"));

    let registry = tracing_subscriber::registry().with(filter_layer);

    if config.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}
