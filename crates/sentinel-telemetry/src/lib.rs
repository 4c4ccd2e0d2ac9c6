//! # Sentinel Telemetry
//!
//! Observability for the CyberSentinel event bus.
//!
//! ## Components
//!
//! - **Logs**: `tracing-subscriber` console output, pretty or JSON
//! - **Traces**: OpenTelemetry spans exported over OTLP, with W3C trace
//!   context carried in message headers
//! - **Metrics**: Prometheus series mirroring the bus delivery counters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sentinel_telemetry::{TelemetryConfig, init_telemetry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TelemetryConfig::from_env();
//!     let _guard = init_telemetry(config).await?;
//!
//!     // Bus activity is now logged, traced and counted
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `http://localhost:4317` | OTLP collector endpoint |
//! | `OTEL_SERVICE_NAME` | `cybersentinel-bus` | Service name in traces |
//! | `CS_OTLP_ENABLED` | `false` | Export spans |
//! | `CS_LOG_LEVEL` | `info` | Log level filter |
//! | `CS_JSON_LOGS` | `false` (`true` in containers) | JSON log lines |

mod config;
mod context;
mod logging;
pub mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use context::{attach_remote_parent, PropagatedContext, TraceContext, TRACEPARENT_HEADER};
pub use logging::init_logging;
pub use metrics::{
    encode_metrics, register_metrics, MetricsHandle, DEAD_LETTER_WRITE_FAILURES,
    DELIVERY_LATENCY, IN_FLIGHT, MESSAGES_ACKED, MESSAGES_CONSUMED, MESSAGES_DEAD_LETTERED,
    MESSAGES_NAKED, MESSAGES_PUBLISHED, REDELIVERIES,
};
pub use tracing_setup::TracingGuard;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize OpenTelemetry tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging, optional span export and the metrics registry.
///
/// Returns a guard that must be held for the lifetime of the application.
/// When dropped, it flushes pending spans.
pub async fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics_handle = register_metrics()?;

    let tracing_guard = if config.otlp_enabled {
        Some(tracing_setup::init_tracing(&config).await?)
    } else {
        logging::init_logging(&config)?;
        None
    };

    Ok(TelemetryGuard {
        _tracing: tracing_guard,
        _metrics: metrics_handle,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: Option<TracingGuard>,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}

/// Convenience macro for creating a span with component context.
#[macro_export]
macro_rules! component_span {
    ($name:expr, $($field:tt)*) => {
        tracing::info_span!($name, $($field)*)
    };
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}

/// Convenience macro for recording a metric with a value.
#[macro_export]
macro_rules! metric_observe {
    ($metric:expr, $value:expr) => {
        $metric.observe($value)
    };
    ($metric:expr, $labels:expr, $value:expr) => {
        $metric.with_label_values($labels).observe($value)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_macros() {
        metric_inc!(MESSAGES_CONSUMED);
        metric_observe!(DELIVERY_LATENCY, 0.01);
        assert!(MESSAGES_CONSUMED.get() >= 1.0);
    }
}
