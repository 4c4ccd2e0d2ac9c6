//! # Sentinel Bus - Durable Event Delivery Core
//!
//! At-least-once delivery between CyberSentinel agents over a persistent
//! publish/subscribe transport (NATS JetStream, or an in-process broker).
//!
//! ## Delivery lifecycle
//!
//! ```text
//!  emit()                       fetch (≤ max_ack_pending un-acked)
//!    │                                   │
//!    ▼                                   ▼
//! ┌───────────┐   CS.<topic>   ┌──────────────────┐  handler ok   ┌───────┐
//! │ Publisher │ ─────────────▶ │ DurableConsumer  │ ────────────▶ │  ack  │
//! └───────────┘                │                  │               └───────┘
//!                              │  BackoffPolicy   │  failed, n < max_deliver
//!                              │                  │ ────────────▶ nak(base·2^(n-1))
//!                              │                  │  failed, n ≥ max_deliver
//!                              └──────────────────┘ ────────────▶ CS_DLQ.<topic>, then ack
//! ```
//!
//! ## Guarantees
//!
//! - A message ends either acked or dead-lettered, never both
//! - A dead-letter write that fails leaves the original unacked (default policy)
//! - Consumer positions live in the transport; a restarted consumer with the
//!   same durable name resumes where the previous one stopped
//! - Backpressure is the transport's `max_ack_pending`

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod backoff;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod message;
pub mod metrics;
pub mod publisher;
pub mod tracing_hooks;
pub mod transport;

// Re-export main types
pub use backoff::{BackoffPolicy, RetryAction, RetryDecision, RetryReason};
pub use bus::{Bus, SubscribeOptions, SubscriptionHandle};
pub use config::{BusConfig, ConfigError, DlqFailurePolicy, TransportKind};
pub use consumer::{handler_fn, DurableConsumer, HandlerFn, MessageHandler};
pub use dead_letter::DeadLetterSink;
pub use error::{BusError, TransportError};
pub use message::{DeadLetterRecord, DeliveryContext, Headers, Message, OutboundMessage};
pub use metrics::{InFlightGuard, MetricsCollector, MetricsSnapshot};
pub use publisher::Publisher;
pub use tracing_hooks::TracingHooks;
pub use transport::{MemoryTransport, NatsTransport, Transport};

/// Cancellation token handed to every [`MessageHandler`].
pub use tokio_util::sync::CancellationToken;
