use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names;
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
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            metric_names::METRIC_HIT_TOTAL,
            Unit::Count,
            "Total number of query cache hits across both tiers."
        );
        describe_counter!(
            metric_names::METRIC_MISS_TOTAL,
            Unit::Count,
            "Total number of query cache misses."
        );
        describe_counter!(
            metric_names::METRIC_SET_TOTAL,
            Unit::Count,
            "Total number of query results stored."
        );
        describe_counter!(
            metric_names::METRIC_DELETE_TOTAL,
            Unit::Count,
            "Total number of entries deleted explicitly or by invalidation."
        );
        describe_counter!(
            metric_names::METRIC_EVICT_TOTAL,
            Unit::Count,
            "Total number of local entries evicted by expiry or capacity."
        );
        describe_gauge!(
            metric_names::METRIC_LOCAL_BYTES,
            Unit::Bytes,
            "Approximate bytes held by the local tier."
        );
        describe_histogram!(
            metric_names::METRIC_CLEANUP_MS,
            Unit::Milliseconds,
            "Cleanup cycle latency in milliseconds."
        );
        describe_histogram!(
            metric_names::METRIC_WARM_MS,
            Unit::Milliseconds,
            "Warming cycle latency in milliseconds."
        );
        describe_histogram!(
            metric_names::METRIC_INVALIDATION_FLUSH_MS,
            Unit::Milliseconds,
            "Batched invalidation flush latency in milliseconds."
        );
    });
}
