//! Trace context propagation through message headers.
//!
//! When a message crosses process boundaries via the bus, the publishing span's
//! context travels in a W3C `traceparent` header so the consuming span can
//! become its child.
//!
//! ## How It Works
//!
//! 1. The publisher extracts the active span's context as a [`PropagatedContext`]
//! 2. The context is rendered into the `traceparent` message header
//! 3. The consumer parses the header back
//! 4. [`attach_remote_parent`] makes the consume span a child of the publish span
//!
//! ## Example
//!
//! ```rust,ignore
//! let span = tracing::info_span!("publish");
//! let _guard = span.enter();
//! if let Some(header) = TraceContext::extract_current().to_propagated().to_traceparent() {
//!     headers.insert(TRACEPARENT_HEADER.to_string(), header);
//! }
//!
//! // On the consuming side
//! if let Some(parent) = headers.get(TRACEPARENT_HEADER).and_then(|h| PropagatedContext::from_traceparent(h)) {
//!     attach_remote_parent(&consume_span, &parent);
//! }
//! ```

use opentelemetry::{
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context,
};
use serde::{Deserialize, Serialize};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Header carrying W3C trace context on bus messages.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Trace context that can be serialized and sent across process boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagatedContext {
    /// Trace ID (32 hex characters)
    pub trace_id: String,
    /// Parent span ID (16 hex characters)
    pub span_id: String,
    /// Trace flags (sampled, etc.)
    pub trace_flags: u8,
}

impl PropagatedContext {
    /// Create an empty context (no parent trace)
    pub fn empty() -> Self {
        Self {
            trace_id: "00000000000000000000000000000000".to_string(),
            span_id: "0000000000000000".to_string(),
            trace_flags: 0,
        }
    }

    /// Check if this context is valid (has a real trace)
    pub fn is_valid(&self) -> bool {
        !self.trace_id.chars().all(|c| c == '0') && !self.span_id.chars().all(|c| c == '0')
    }

    /// Render as a `traceparent` header value (`00-<trace>-<span>-<flags>`).
    pub fn to_traceparent(&self) -> Option<String> {
        self.is_valid().then(|| {
            format!(
                "00-{}-{}-{:02x}",
                self.trace_id, self.span_id, self.trace_flags
            )
        })
    }

    /// Parse a `traceparent` header value. Returns `None` for malformed or empty contexts.
    pub fn from_traceparent(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version != "00" || parts.next().is_some() {
            return None;
        }
        if trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }
        let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());
        if !is_hex(trace_id) || !is_hex(span_id) {
            return None;
        }

        let context = Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            trace_flags: u8::from_str_radix(flags, 16).ok()?,
        };
        context.is_valid().then_some(context)
    }

    /// Convert to a trace context for parenting child spans.
    pub fn to_context(&self) -> TraceContext {
        if !self.is_valid() {
            return TraceContext::new();
        }

        let trace_id = TraceId::from_hex(&self.trace_id).unwrap_or(TraceId::INVALID);
        let span_id = SpanId::from_hex(&self.span_id).unwrap_or(SpanId::INVALID);

        let span_context = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::new(self.trace_flags),
            true, // remote = true (came from another process)
            TraceState::default(),
        );

        TraceContext {
            span_context: Some(span_context),
        }
    }
}

/// Wrapper for an OpenTelemetry span context with helper methods.
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    span_context: Option<SpanContext>,
}

impl TraceContext {
    /// Create a new empty trace context.
    pub fn new() -> Self {
        Self { span_context: None }
    }

    /// Extract the trace context of the current `tracing` span.
    ///
    /// Empty unless the OpenTelemetry layer is installed.
    pub fn extract_current() -> Self {
        let context = tracing::Span::current().context();
        let span_context = context.span().span_context().clone();

        Self {
            span_context: span_context.is_valid().then_some(span_context),
        }
    }

    /// Convert to a propagatable format for serialization.
    pub fn to_propagated(&self) -> PropagatedContext {
        match &self.span_context {
            Some(ctx) if ctx.is_valid() => PropagatedContext {
                trace_id: ctx.trace_id().to_string(),
                span_id: ctx.span_id().to_string(),
                trace_flags: ctx.trace_flags().to_u8(),
            },
            _ => PropagatedContext::empty(),
        }
    }

    /// Check if this context has a valid trace.
    pub fn is_valid(&self) -> bool {
        self.span_context
            .as_ref()
            .map(|c| c.is_valid())
            .unwrap_or(false)
    }
}

/// Make `span` a child of a context received from another process.
pub fn attach_remote_parent(span: &tracing::Span, parent: &PropagatedContext) {
    if let Some(span_context) = parent.to_context().span_context {
        span.set_parent(Context::new().with_remote_span_context(span_context));
    }
}
