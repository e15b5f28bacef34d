//! Shared tracing/logging initialization.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is not set (e.g. `"fluxgate_panel=info"`).
/// * `log_json` -- emit one JSON object per line instead of the human-readable format.
///
/// Calling this a second time is a no-op; the first subscriber stays installed.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let json_layer = log_json.then(|| fmt::layer().json().with_current_span(false));
    let text_layer = (!log_json).then(fmt::layer);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}
