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
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "mathexport_render_cache_hit_total",
            Unit::Count,
            "Total number of formula renders served from the disk cache."
        );
        describe_counter!(
            "mathexport_render_cache_miss_total",
            Unit::Count,
            "Total number of formula cache lookups that found no entry."
        );
        describe_counter!(
            "mathexport_render_cache_evict_total",
            Unit::Count,
            "Total number of cache entries removed by eviction sweeps."
        );
        describe_counter!(
            "mathexport_render_fragment_error_total",
            Unit::Count,
            "Total number of fragments the math engine rejected."
        );
        describe_counter!(
            "mathexport_render_batch_timeout_total",
            Unit::Count,
            "Total number of render batches that hit their shared deadline."
        );
        describe_histogram!(
            "mathexport_render_batch_ms",
            Unit::Milliseconds,
            "Render batch wall-clock latency in milliseconds."
        );
        describe_counter!(
            "mathexport_jobs_submitted_total",
            Unit::Count,
            "Total number of export jobs submitted."
        );
        describe_counter!(
            "mathexport_jobs_finished_total",
            Unit::Count,
            "Total number of export jobs that published an artifact."
        );
        describe_counter!(
            "mathexport_jobs_failed_total",
            Unit::Count,
            "Total number of export jobs that ended in failure."
        );
    });
}
