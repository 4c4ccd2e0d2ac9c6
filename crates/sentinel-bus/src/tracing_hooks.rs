//! Optional spans around publish and consume.
//!
//! Span names follow `bus.publish.<subject>` / `bus.consume.<subject>` through
//! the `otel.name` field. With tracing disabled every hook returns
//! [`Span::none`], so instrumented code paths cost nothing extra.

use std::time::Duration;

use sentinel_telemetry::{attach_remote_parent, PropagatedContext, TraceContext, TRACEPARENT_HEADER};
use tracing::field::Empty;
use tracing::Span;

use crate::message::{DeliveryContext, Headers};

/// Span factory for the bus hot paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks {
    enabled: bool,
}

impl TracingHooks {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn publish_span(&self, subject: &str) -> Span {
        if !self.enabled {
            return Span::none();
        }
        tracing::info_span!(
            "bus.publish",
            otel.name = %format!("bus.publish.{subject}"),
            otel.kind = "producer",
            otel.status_code = Empty,
            messaging.destination = %subject,
            messaging.sequence = Empty,
        )
    }

    /// Write the span's trace context into `headers` as `traceparent`.
    pub fn inject(&self, span: &Span, headers: &mut Headers) {
        if !self.enabled || headers.contains_key(TRACEPARENT_HEADER) {
            return;
        }
        let context = span.in_scope(TraceContext::extract_current).to_propagated();
        if let Some(traceparent) = context.to_traceparent() {
            headers.insert(TRACEPARENT_HEADER.to_string(), traceparent);
        }
    }

    pub fn record_published(&self, span: &Span, sequence: u64) {
        span.record("messaging.sequence", sequence);
    }

    /// Span for one delivery, parented to the publisher's span when the message carries one.
    pub fn consume_span(&self, delivery: &DeliveryContext) -> Span {
        if !self.enabled {
            return Span::none();
        }
        let message = &delivery.message;
        let span = tracing::info_span!(
            "bus.consume",
            otel.name = %format!("bus.consume.{}", message.subject),
            otel.kind = "consumer",
            otel.status_code = Empty,
            messaging.destination = %message.subject,
            messaging.sequence = message.sequence,
            messaging.num_delivered = delivery.num_delivered,
            messaging.consumer = %delivery.consumer_durable_name,
            processing.duration_ms = Empty,
            error.message = Empty,
        );

        if let Some(parent) = message
            .headers
            .get(TRACEPARENT_HEADER)
            .and_then(|h| PropagatedContext::from_traceparent(h))
        {
            attach_remote_parent(&span, &parent);
        }
        span
    }

    /// Record handler duration and, on failure, mark the span as errored.
    pub fn record_outcome(&self, span: &Span, duration: Duration, error: Option<&str>) {
        span.record("processing.duration_ms", duration.as_secs_f64() * 1000.0);
        if let Some(error) = error {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", error);
        }
    }
}
