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

pub const METRIC_JOBS_ENQUEUED: &str = "folio_jobs_enqueued_total";
pub const METRIC_JOBS_ACKED: &str = "folio_jobs_acked_total";
pub const METRIC_JOBS_REQUEUED: &str = "folio_jobs_requeued_total";
pub const METRIC_JOBS_DEAD_LETTERED: &str = "folio_jobs_dead_lettered_total";
pub const METRIC_SCHEDULER_FIRED: &str = "folio_scheduler_fired_total";
pub const METRIC_CONVERT_MS: &str = "folio_convert_ms";

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
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_JOBS_ENQUEUED,
            Unit::Count,
            "Total number of jobs accepted by the queue."
        );
        describe_counter!(
            METRIC_JOBS_ACKED,
            Unit::Count,
            "Total number of deliveries acknowledged after a successful attempt."
        );
        describe_counter!(
            METRIC_JOBS_REQUEUED,
            Unit::Count,
            "Total number of failed attempts requeued with backoff."
        );
        describe_counter!(
            METRIC_JOBS_DEAD_LETTERED,
            Unit::Count,
            "Total number of jobs moved to the dead-letter set."
        );
        describe_counter!(
            METRIC_SCHEDULER_FIRED,
            Unit::Count,
            "Total number of schedule firings that enqueued a job."
        );
        describe_histogram!(
            METRIC_CONVERT_MS,
            Unit::Milliseconds,
            "HTML to PDF conversion latency in milliseconds."
        );
    });
}
