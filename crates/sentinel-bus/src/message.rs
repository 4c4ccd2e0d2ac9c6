//! # Messages
//!
//! Types that flow through the bus: the immutable [`Message`] the transport
//! stores, the per-delivery [`DeliveryContext`] handed to handlers, and the
//! [`DeadLetterRecord`] written when a message exhausts its redelivery budget.

use std::collections::BTreeMap;
use tokio::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::BusError;

/// Ordered header map carried by every message.
pub type Headers = BTreeMap<String, String>;

/// Dead-letter header: subject the message was originally published on.
pub const HEADER_ORIGINAL_SUBJECT: &str = "Original-Subject";
/// Dead-letter header: truncated handler error.
pub const HEADER_ERROR: &str = "Error";
/// Dead-letter header: delivery attempts made before dead-lettering.
pub const HEADER_NUM_DELIVERED: &str = "Num-Delivered";
/// Dead-letter header: unix milliseconds of the dead-letter write.
pub const HEADER_DEAD_LETTERED_AT: &str = "Dead-Lettered-At";
/// Dead-letter header: stream sequence of the original message.
pub const HEADER_ORIGINAL_SEQUENCE: &str = "Original-Sequence";
/// Dead-letter header: durable consumer that gave up on the message.
pub const HEADER_CONSUMER: &str = "Consumer";
/// Transport de-duplication key.
pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";

const DIAGNOSTIC_HEADERS: [&str; 7] = [
    HEADER_ORIGINAL_SUBJECT,
    HEADER_ERROR,
    HEADER_NUM_DELIVERED,
    HEADER_DEAD_LETTERED_AT,
    HEADER_ORIGINAL_SEQUENCE,
    HEADER_CONSUMER,
    HEADER_MSG_ID,
];

/// A message as stored by the transport. Immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
    /// Transport-assigned, monotonic per stream
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
}

/// A message about to be appended to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Runtime record for one delivery of one message to a handler.
///
/// Created each time a message is handed out; discarded after ack/nak.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub message: Message,
    /// Transport-reported delivery count, starting at 1
    pub num_delivered: u32,
    /// Transport-side durable name of the consuming subscription
    pub consumer_durable_name: String,
    pub fetched_at: Instant,
    /// Point after which the transport may redeliver this message elsewhere
    pub ack_deadline: Instant,
}

impl DeliveryContext {
    /// Whether this is a redelivery of a previously handed-out message.
    pub fn is_redelivery(&self) -> bool {
        self.num_delivered > 1
    }
}

/// Diagnostic record written once per exhausted message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub original_message: Message,
    pub error_summary: String,
    pub num_delivered: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub consumer: String,
}

impl DeadLetterRecord {
    /// Build a record, truncating the error to `error_max_len` bytes.
    pub fn new(
        original_message: Message,
        error: &str,
        num_delivered: u32,
        consumer: impl Into<String>,
        error_max_len: usize,
    ) -> Self {
        Self {
            original_message,
            error_summary: truncate(error, error_max_len).to_string(),
            num_delivered,
            dead_lettered_at: Utc::now(),
            consumer: consumer.into(),
        }
    }

    /// Idempotency key for the dead-letter write of this exhaustion event.
    pub fn dedup_key(&self) -> String {
        format!(
            "dlq:{}:{}",
            self.original_message.subject, self.original_message.sequence
        )
    }

    /// Original headers followed by the diagnostic headers.
    pub fn headers(&self) -> Headers {
        let mut headers = self.original_message.headers.clone();
        headers.insert(
            HEADER_ORIGINAL_SUBJECT.to_string(),
            self.original_message.subject.clone(),
        );
        headers.insert(HEADER_ERROR.to_string(), self.error_summary.clone());
        headers.insert(
            HEADER_NUM_DELIVERED.to_string(),
            self.num_delivered.to_string(),
        );
        headers.insert(
            HEADER_DEAD_LETTERED_AT.to_string(),
            self.dead_lettered_at.timestamp_millis().to_string(),
        );
        headers.insert(
            HEADER_ORIGINAL_SEQUENCE.to_string(),
            self.original_message.sequence.to_string(),
        );
        headers.insert(HEADER_CONSUMER.to_string(), self.consumer.clone());
        headers.insert(HEADER_MSG_ID.to_string(), self.dedup_key());
        headers
    }

    /// Message to append to the dead-letter subject.
    pub fn to_outbound(&self, dlq_subject: impl Into<String>) -> OutboundMessage {
        OutboundMessage::new(dlq_subject, self.original_message.payload.clone())
            .with_headers(self.headers())
    }

    /// Parse a record back out of a message read from the dead-letter stream.
    pub fn from_message(message: &Message) -> Result<Self, BusError> {
        let header = |key: &str| {
            message
                .headers
                .get(key)
                .ok_or_else(|| BusError::DeadLetter(format!("missing {key} header")))
        };

        let subject = header(HEADER_ORIGINAL_SUBJECT)?.clone();
        let num_delivered = header(HEADER_NUM_DELIVERED)?
            .parse()
            .map_err(|_| BusError::DeadLetter("bad Num-Delivered header".into()))?;
        let at_ms: i64 = header(HEADER_DEAD_LETTERED_AT)?
            .parse()
            .map_err(|_| BusError::DeadLetter("bad Dead-Lettered-At header".into()))?;
        let dead_lettered_at = Utc
            .timestamp_millis_opt(at_ms)
            .single()
            .ok_or_else(|| BusError::DeadLetter("Dead-Lettered-At out of range".into()))?;
        let sequence = message
            .headers
            .get(HEADER_ORIGINAL_SEQUENCE)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let original_headers = message
            .headers
            .iter()
            .filter(|(k, _)| !DIAGNOSTIC_HEADERS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            original_message: Message {
                subject,
                payload: message.payload.clone(),
                headers: original_headers,
                sequence,
                published_at: message.published_at,
            },
            error_summary: message.headers.get(HEADER_ERROR).cloned().unwrap_or_default(),
            num_delivered,
            dead_lettered_at,
            consumer: message.headers.get(HEADER_CONSUMER).cloned().unwrap_or_default(),
        })
    }
}

/// Reject subjects the transport cannot publish to.
pub fn validate_subject(subject: &str) -> Result<(), BusError> {
    let invalid = |reason| {
        Err(BusError::InvalidSubject {
            subject: subject.to_string(),
            reason,
        })
    };

    if subject.is_empty() {
        return invalid("empty subject");
    }
    if subject.chars().any(char::is_whitespace) {
        return invalid("whitespace in subject");
    }
    if subject.split('.').any(str::is_empty) {
        return invalid("empty subject token");
    }
    if subject.split('.').any(|t| t == "*" || t == ">") {
        return invalid("wildcards are not allowed when publishing");
    }
    Ok(())
}

/// NATS-style subject matching: `*` matches one token, a trailing `>` matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
