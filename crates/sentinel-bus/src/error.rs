//! Error types for the delivery core.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to transport: {0}")]
    Connect(String),

    #[error("Transient transport failure: {0}")]
    Transient(String),

    #[error("Payload too large: {size} > {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("No stream captures subject {subject}")]
    NoStream { subject: String },

    #[error("Consumer not found: {stream}/{durable}")]
    ConsumerNotFound { stream: String, durable: String },

    #[error("Transport closed")]
    Closed,

    #[error("Transport rejected the request: {0}")]
    Rejected(String),

    /// The delivery's ack deadline passed and the message was queued for redelivery
    #[error("Delivery of sequence {sequence} expired before it was settled")]
    DeliveryExpired { sequence: u64 },
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors surfaced to callers of the [`Bus`](crate::Bus) facade.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus is not connected")]
    NotConnected,

    #[error("Invalid subject {subject:?}: {reason}")]
    InvalidSubject { subject: String, reason: &'static str },

    #[error("Payload too large: {size} > {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Publish to {subject} failed after {attempts} attempt(s): {source}")]
    PublishFailed {
        subject: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed dead-letter record: {0}")]
    DeadLetter(String),
}

impl BusError {
    /// Maps a non-retryable transport error from a publish into the caller-facing taxonomy.
    pub(crate) fn from_publish(subject: &str, attempts: u32, error: TransportError) -> Self {
        match error {
            TransportError::PayloadTooLarge { size, max } => Self::PayloadTooLarge { size, max },
            TransportError::Closed => Self::NotConnected,
            source => Self::PublishFailed {
                subject: subject.to_string(),
                attempts,
                source,
            },
        }
    }
}
