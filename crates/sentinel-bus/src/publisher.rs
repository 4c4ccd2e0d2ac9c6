//! # Publisher
//!
//! Validates and durably appends messages. Transient transport failures are
//! retried with the same [`BackoffPolicy`] the consumers use; size and subject
//! violations are rejected synchronously and never retried.
//!
//! Every `emit` carries a `Nats-Msg-Id` (caller-supplied or generated), so a
//! retry of an append that actually reached the transport is stored once.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::message::{validate_subject, Headers, OutboundMessage, HEADER_MSG_ID};
use crate::metrics::MetricsCollector;
use crate::tracing_hooks::TracingHooks;
use crate::transport::{PublishAck, Transport};

/// Publishing side of the bus. Shared by `emit` callers and the dead-letter sink.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    max_attempts: u32,
    metrics: Arc<MetricsCollector>,
    hooks: TracingHooks,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &BusConfig,
        metrics: Arc<MetricsCollector>,
        hooks: TracingHooks,
    ) -> Self {
        Self {
            transport,
            policy: BackoffPolicy::from_config(config),
            max_attempts: config.publish_max_attempts.max(1),
            metrics,
            hooks,
        }
    }

    /// Publish `payload` on `subject` and return the transport-assigned sequence.
    pub async fn emit(
        &self,
        subject: &str,
        payload: Bytes,
        mut headers: Headers,
    ) -> Result<u64, BusError> {
        validate_subject(subject)?;
        self.check_size(payload.len())?;

        headers
            .entry(HEADER_MSG_ID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());

        let span = self.hooks.publish_span(subject);
        self.hooks.inject(&span, &mut headers);

        let message = OutboundMessage {
            subject: subject.to_string(),
            payload,
            headers,
        };

        // Counted before the append so `published` never trails `acked`
        self.metrics.reserve_publish();
        match self.append(message).instrument(span.clone()).await {
            Ok(ack) => {
                self.hooks.record_published(&span, ack.sequence);
                if ack.duplicate {
                    self.metrics.revert_publish();
                    debug!(subject, sequence = ack.sequence, "Duplicate publish dropped by transport");
                } else {
                    self.metrics.confirm_publish();
                }
                Ok(ack.sequence)
            }
            Err(e) => {
                self.metrics.revert_publish();
                Err(e)
            }
        }
    }

    /// Append with transient-failure retries. Does not touch `published`.
    pub(crate) async fn append(&self, message: OutboundMessage) -> Result<PublishAck, BusError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.publish(message.clone()).await {
                Ok(ack) => {
                    debug!(subject = %message.subject, sequence = ack.sequence, attempt, "Published");
                    return Ok(ack);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        subject = %message.subject,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient publish failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(BusError::from_publish(&message.subject, attempt, e)),
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), BusError> {
        let max = self.transport.max_payload();
        if size > max {
            return Err(BusError::PayloadTooLarge { size, max });
        }
        Ok(())
    }
}
