use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

pub(crate) const METRIC_RENDER_TOTAL: &str = "disegno_render_total";
pub(crate) const METRIC_RENDER_FAILURE_TOTAL: &str = "disegno_render_failure_total";
pub(crate) const METRIC_RENDER_TIMEOUT_TOTAL: &str = "disegno_render_timeout_total";
pub(crate) const METRIC_RENDER_MS: &str = "disegno_render_ms";
pub(crate) const METRIC_SANDBOX_BOOT_MS: &str = "disegno_sandbox_boot_ms";
pub(crate) const METRIC_RASTER_MS: &str = "disegno_raster_ms";
pub(crate) const METRIC_CLIPBOARD_WRITE_TOTAL: &str = "disegno_clipboard_write_total";
pub(crate) const METRIC_CLIPBOARD_FAILURE_TOTAL: &str = "disegno_clipboard_failure_total";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Install(err.to_string()))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_RENDER_TOTAL,
            Unit::Count,
            "Total number of render requests published to the sandbox."
        );
        describe_counter!(
            METRIC_RENDER_FAILURE_TOTAL,
            Unit::Count,
            "Total number of render requests the sandbox rejected."
        );
        describe_counter!(
            METRIC_RENDER_TIMEOUT_TOTAL,
            Unit::Count,
            "Total number of render requests abandoned by the client-side timeout."
        );
        describe_histogram!(
            METRIC_RENDER_MS,
            Unit::Milliseconds,
            "Render round-trip latency in milliseconds."
        );
        describe_histogram!(
            METRIC_SANDBOX_BOOT_MS,
            Unit::Milliseconds,
            "Sandbox launch-to-ready latency in milliseconds."
        );
        describe_histogram!(
            METRIC_RASTER_MS,
            Unit::Milliseconds,
            "SVG-to-PNG conversion latency in milliseconds."
        );
        describe_counter!(
            METRIC_CLIPBOARD_WRITE_TOTAL,
            Unit::Count,
            "Total number of successful clipboard image writes."
        );
        describe_counter!(
            METRIC_CLIPBOARD_FAILURE_TOTAL,
            Unit::Count,
            "Total number of clipboard image writes that failed."
        );
    });
}
