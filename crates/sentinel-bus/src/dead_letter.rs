//! # Dead-letter sink
//!
//! Messages that exhaust `max_deliver` are appended, payload unchanged, to
//! `{prefix}_DLQ.<topic>` with diagnostic headers:
//!
//! | Header | Value |
//! |--------|-------|
//! | `Original-Subject` | subject the message was published on |
//! | `Error` | last handler error, truncated to `dlq_error_max_len` bytes |
//! | `Num-Delivered` | delivery attempts made |
//! | `Dead-Lettered-At` | unix milliseconds |
//! | `Original-Sequence` | stream sequence of the original |
//! | `Consumer` | durable that gave up |
//! | `Nats-Msg-Id` | `dlq:<subject>:<sequence>` |
//!
//! The message id makes the write idempotent: a retried write, or a second
//! consumer instance dead-lettering the same exhausted delivery, is stored once.

use std::sync::Arc;
use std::time::Duration;

use sentinel_telemetry::log_delivery_event;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::message::{DeadLetterRecord, Message, HEADER_MSG_ID};
use crate::metrics::MetricsCollector;
use crate::publisher::Publisher;
use crate::transport::{ConsumerSpec, Transport};

/// Longest a redrive pull waits for more dead letters.
const REDRIVE_FETCH_EXPIRES: Duration = Duration::from_millis(100);

/// Writes exhausted messages to the dead-letter stream.
pub struct DeadLetterSink {
    publisher: Arc<Publisher>,
    config: Arc<BusConfig>,
    metrics: Arc<MetricsCollector>,
}

impl DeadLetterSink {
    pub fn new(publisher: Arc<Publisher>, config: Arc<BusConfig>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            publisher,
            config,
            metrics,
        }
    }

    /// Append a dead-letter record for `message`.
    ///
    /// Retries like any publish. An `Err` means the record was not written and
    /// the caller must not ack the original.
    pub async fn record(
        &self,
        message: &Message,
        error: &str,
        num_delivered: u32,
        consumer: &str,
    ) -> Result<DeadLetterRecord, BusError> {
        let record = DeadLetterRecord::new(
            message.clone(),
            error,
            num_delivered,
            consumer,
            self.config.dlq_error_max_len,
        );
        let dlq_subject = self.config.dlq_subject_for(&message.subject);

        match self.publisher.append(record.to_outbound(dlq_subject.as_str())).await {
            Ok(ack) => {
                log_delivery_event!(
                    warn,
                    "dead_letter",
                    "Message dead-lettered",
                    message.subject,
                    message.sequence,
                    dlq_subject = %dlq_subject,
                    dlq_sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    num_delivered,
                    consumer
                );
                Ok(record)
            }
            Err(e) => {
                self.metrics.record_dead_letter_failure();
                log_delivery_event!(
                    error,
                    "dead_letter",
                    "Dead-letter write failed",
                    message.subject,
                    message.sequence,
                    error = %e,
                    num_delivered,
                    consumer
                );
                Err(e)
            }
        }
    }

    /// Re-emit up to `max` dead letters of `topic` to their original subject.
    ///
    /// A dead letter is acked only after its re-emit succeeded. Returns the
    /// number of messages redriven.
    pub async fn redrive(
        &self,
        transport: &dyn Transport,
        topic: &str,
        max: usize,
    ) -> Result<usize, BusError> {
        let stream = self.config.dlq_stream_name();
        // One durable per topic; a consumer's filter is fixed once created
        let durable = self.config.durable_for(&format!("dlq-redrive-{topic}"));
        transport
            .ensure_consumer(&ConsumerSpec {
                stream: stream.clone(),
                durable: durable.clone(),
                filter_subject: self.config.dlq_subject_for(&self.config.subject_for(topic)),
                ack_wait: self.config.ack_wait,
                max_deliver: u32::MAX,
                max_ack_pending: self.config.max_ack_pending,
            })
            .await?;

        let mut redriven = 0;
        while redriven < max {
            let batch = transport
                .fetch(&stream, &durable, max - redriven, REDRIVE_FETCH_EXPIRES)
                .await?;
            if batch.is_empty() {
                break;
            }

            for delivery in batch {
                let record = match DeadLetterRecord::from_message(&delivery.message) {
                    Ok(record) => record,
                    Err(e) => {
                        // Left unacked; it comes back after ack_wait for inspection
                        warn!(sequence = delivery.message.sequence, error = %e, "Skipping malformed dead letter");
                        continue;
                    }
                };

                let original = record.original_message;
                let mut headers = original.headers;
                headers.insert(
                    HEADER_MSG_ID.to_string(),
                    format!("redrive:{}:{}", delivery.message.subject, delivery.message.sequence),
                );

                let sequence = self
                    .publisher
                    .emit(&original.subject, original.payload, headers)
                    .await?;
                delivery.acker.ack().await?;
                redriven += 1;

                debug!(
                    subject = %original.subject,
                    original_sequence = original.sequence,
                    sequence,
                    "Dead letter redriven"
                );
            }
        }

        Ok(redriven)
    }
}
