use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "frostline_jobs_resolved_total",
            Unit::Count,
            "Total number of backend jobs resolved, labelled by kind and result."
        );
        describe_counter!(
            "frostline_http_cache_hit_total",
            Unit::Count,
            "Total number of HTTP jobs served from the on-disk response cache."
        );
        describe_counter!(
            "frostline_http_cache_miss_total",
            Unit::Count,
            "Total number of HTTP jobs that missed the on-disk response cache."
        );
        describe_counter!(
            "frostline_pages_rendered_total",
            Unit::Count,
            "Total number of pages rendered successfully."
        );
        describe_counter!(
            "frostline_pages_failed_total",
            Unit::Count,
            "Total number of pages whose render failed."
        );
        describe_histogram!(
            "frostline_session_ms",
            Unit::Milliseconds,
            "Render session latency in milliseconds."
        );
    });
}
