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
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the service emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "social_cards_cache_hit_total",
            Unit::Count,
            "Card requests served from the object store."
        );
        describe_counter!(
            "social_cards_cache_miss_total",
            Unit::Count,
            "Card requests that required a render."
        );
        describe_counter!(
            "social_cards_cache_read_error_total",
            Unit::Count,
            "Object store reads that failed and were treated as misses."
        );
        describe_counter!(
            "social_cards_cache_write_error_total",
            Unit::Count,
            "Rendered cards that could not be written to the object store."
        );
        describe_histogram!(
            "social_cards_render_ms",
            Unit::Milliseconds,
            "Successful render latency in milliseconds."
        );
        describe_counter!(
            "social_cards_render_failure_total",
            Unit::Count,
            "Renders that failed or timed out, labelled by reason."
        );
        describe_counter!(
            "social_cards_singleflight_joined_total",
            Unit::Count,
            "Requests that joined a render already in flight for the same key."
        );
        describe_counter!(
            "social_cards_purge_deleted_total",
            Unit::Count,
            "Objects deleted by cache purges."
        );
        describe_counter!(
            "social_cards_invalidation_failure_total",
            Unit::Count,
            "CDN invalidations that failed after retries."
        );
    });
}
