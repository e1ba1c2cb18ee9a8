use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            "vetrina_pool_live",
            Unit::Count,
            "Rendering environments currently in circulation."
        );
        describe_gauge!(
            "vetrina_pool_idle",
            Unit::Count,
            "Rendering environments sitting idle in the pool."
        );
        describe_counter!(
            "vetrina_pool_retired_total",
            Unit::Count,
            "Total number of environments retired after reaching the usage ceiling."
        );
        describe_counter!(
            "vetrina_pool_construct_failures_total",
            Unit::Count,
            "Total number of failed environment constructions."
        );
        describe_histogram!(
            "vetrina_pool_acquire_wait_ms",
            Unit::Milliseconds,
            "Time requests spent waiting for a free rendering environment."
        );
        describe_counter!(
            "vetrina_ssr_rendered_total",
            Unit::Count,
            "Total number of requests answered with server-rendered markup."
        );
        describe_counter!(
            "vetrina_ssr_passthrough_total",
            Unit::Count,
            "Total number of requests handed to the client-side fallback."
        );
        describe_counter!(
            "vetrina_ssr_render_failures_total",
            Unit::Count,
            "Total number of renders that failed and fell back to pass-through."
        );
        describe_counter!(
            "vetrina_ssr_loader_failures_total",
            Unit::Count,
            "Total number of route data loaders that failed before a render."
        );
        describe_counter!(
            "vetrina_ssr_stability_timeouts_total",
            Unit::Count,
            "Total number of renders serialized after the stability wait timed out."
        );
        describe_histogram!(
            "vetrina_ssr_render_ms",
            Unit::Milliseconds,
            "End-to-end render pipeline latency in milliseconds."
        );
    });
}
