//! Prometheus metrics for the event bus.
//!
//! All metrics follow the naming convention: `cs_bus_<metric>_<unit>`
//!
//! The in-process `MetricsCollector` in `sentinel-bus` is the source of truth
//! for snapshots; these process-wide series mirror it for scraping.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, Encoder, Gauge, Histogram, HistogramOpts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH
    // =========================================================================

    pub static ref MESSAGES_PUBLISHED: Counter = Counter::new(
        "cs_bus_messages_published_total",
        "Messages durably appended by emit()"
    ).expect("metric creation failed");

    // =========================================================================
    // CONSUME
    // =========================================================================

    pub static ref MESSAGES_CONSUMED: Counter = Counter::new(
        "cs_bus_messages_consumed_total",
        "Deliveries handed to a handler"
    ).expect("metric creation failed");

    pub static ref MESSAGES_ACKED: Counter = Counter::new(
        "cs_bus_messages_acked_total",
        "Deliveries acknowledged after a successful handler"
    ).expect("metric creation failed");

    pub static ref MESSAGES_NAKED: Counter = Counter::new(
        "cs_bus_messages_naked_total",
        "Deliveries negatively acknowledged for delayed redelivery"
    ).expect("metric creation failed");

    pub static ref REDELIVERIES: Counter = Counter::new(
        "cs_bus_redeliveries_total",
        "Redeliveries scheduled by the retry policy"
    ).expect("metric creation failed");

    /// Deliveries fetched and not yet settled
    pub static ref IN_FLIGHT: Gauge = Gauge::new(
        "cs_bus_in_flight",
        "Deliveries fetched but not yet acked or naked"
    ).expect("metric creation failed");

    /// End-to-end latency from publish to handler completion
    pub static ref DELIVERY_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "cs_bus_delivery_latency_seconds",
            "Time from publish to handler completion"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).unwrap_or_default())
    ).expect("metric creation failed");

    // =========================================================================
    // DEAD LETTERS
    // =========================================================================

    pub static ref MESSAGES_DEAD_LETTERED: Counter = Counter::new(
        "cs_bus_messages_dead_lettered_total",
        "Messages moved to the dead-letter stream"
    ).expect("metric creation failed");

    /// Dead-letter writes that failed after retries (alerting signal)
    pub static ref DEAD_LETTER_WRITE_FAILURES: Counter = Counter::new(
        "cs_bus_dead_letter_write_failures_total",
        "Dead-letter writes that failed after exhausting publish retries"
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all bus metrics with the global registry.
///
/// Fails if called twice in one process.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(MESSAGES_CONSUMED.clone()),
        Box::new(MESSAGES_ACKED.clone()),
        Box::new(MESSAGES_NAKED.clone()),
        Box::new(REDELIVERIES.clone()),
        Box::new(IN_FLIGHT.clone()),
        Box::new(DELIVERY_LATENCY.clone()),
        Box::new(MESSAGES_DEAD_LETTERED.clone()),
        Box::new(DEAD_LETTER_WRITE_FAILURES.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
