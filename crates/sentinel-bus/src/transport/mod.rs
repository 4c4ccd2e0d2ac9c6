//! Transport port.
//!
//! The persistent pub/sub transport stays an external collaborator: the bus
//! only talks to it through [`Transport`]. Two adapters implement it:
//!
//! - [`NatsTransport`]: NATS JetStream
//! - [`MemoryTransport`]: in-process broker with the same delivery semantics,
//!   used for `memory://` URLs, tests and load runs
//!
//! The consumer cursor lives entirely inside the transport, keyed by
//! `(stream, durable)`. Nothing in the bus caches or shadows it.

mod memory;
mod nats;

pub use memory::{ConsumerInfo, MemoryTransport};
pub use nats::NatsTransport;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::{Message, OutboundMessage};

/// Stream definition passed to [`Transport::ensure_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    /// Subject filters captured by the stream (`CS.>`)
    pub subjects: Vec<String>,
    /// Window inside which a repeated `Nats-Msg-Id` is stored once
    pub duplicate_window: Duration,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            duplicate_window: Duration::from_secs(120),
        }
    }
}

/// Durable pull consumer definition passed to [`Transport::ensure_consumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub durable: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    /// Deliveries after which the transport stops redelivering
    pub max_deliver: u32,
    /// Un-acked deliveries the transport hands out at once
    pub max_ack_pending: u32,
}

/// Acknowledgement of a durable append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence: u64,
    /// The append was dropped as a duplicate of an earlier `Nats-Msg-Id`
    pub duplicate: bool,
}

/// Settles one delivery with the transport.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    /// Ask for redelivery after `delay`.
    async fn nak(&self, delay: Duration) -> Result<(), TransportError>;
}

/// One message handed out by [`Transport::fetch`].
pub struct Delivery {
    pub message: Message,
    /// Transport-reported delivery count, starting at 1
    pub num_delivered: u32,
    pub acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject)
            .field("sequence", &self.message.sequence)
            .field("num_delivered", &self.num_delivered)
            .finish_non_exhaustive()
    }
}

/// Persistent, subject-addressed, at-least-once transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create the stream if missing. Idempotent.
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), TransportError>;

    /// Durably append one message.
    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck, TransportError>;

    /// Get or create a durable consumer keyed by `(stream, durable)`.
    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<(), TransportError>;

    /// Pull up to `max_messages`, waiting at most `expires` for the first one.
    ///
    /// Returns an empty batch when nothing is deliverable, including when the
    /// consumer already holds `max_ack_pending` un-acked deliveries.
    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Largest payload the transport accepts, in bytes.
    fn max_payload(&self) -> usize;

    async fn close(&self) -> Result<(), TransportError>;
}
