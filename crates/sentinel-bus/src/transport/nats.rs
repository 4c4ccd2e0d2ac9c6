//! NATS JetStream adapter.
//!
//! Streams use file storage with a duplicate window so `Nats-Msg-Id` makes
//! dead-letter writes idempotent. Consumers are durable pull consumers with
//! explicit acks; the server owns cursor, delivery counts and `max_ack_pending`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, consumer::PullConsumer, AckKind};
use async_nats::{HeaderMap, ServerAddr};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Acker, ConsumerSpec, Delivery, PublishAck, StreamSpec, Transport};
use crate::config::BusConfig;
use crate::error::TransportError;
use crate::message::{Headers, Message, OutboundMessage};

/// JetStream-backed transport.
pub struct NatsTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    consumers: RwLock<HashMap<(String, String), PullConsumer>>,
    closed: AtomicBool,
}

impl NatsTransport {
    /// Connect using the URL, credentials and timeout from `config`.
    pub async fn connect(config: &BusConfig) -> Result<Self, TransportError> {
        let addr: ServerAddr = config
            .transport_url
            .parse()
            .map_err(|e| TransportError::Connect(format!("{}: {e}", config.transport_url)))?;

        let mut options =
            async_nats::ConnectOptions::new().connection_timeout(config.connect_timeout);
        if let Some(path) = &config.credentials_file {
            options = options
                .credentials_file(path)
                .await
                .map_err(|e| TransportError::Connect(format!("credentials: {e}")))?;
        }

        let client = options
            .connect(addr)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!(url = %config.transport_url, "Connected to NATS");

        Ok(Self {
            jetstream: jetstream::new(client.clone()),
            client,
            consumers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn consumer(&self, stream: &str, durable: &str) -> Result<PullConsumer, TransportError> {
        self.consumers
            .read()
            .await
            .get(&(stream.to_string(), durable.to_string()))
            .cloned()
            .ok_or_else(|| TransportError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })
    }

    /// Pull a batch; `expires == None` returns only what is immediately available.
    async fn pull(
        consumer: &PullConsumer,
        max_messages: usize,
        expires: Option<Duration>,
    ) -> Result<Vec<jetstream::Message>, TransportError> {
        let mut batch = match expires {
            None => consumer
                .fetch()
                .max_messages(max_messages)
                .messages()
                .await
                .map_err(transient)?,
            Some(expires) => consumer
                .batch()
                .max_messages(max_messages)
                .expires(expires)
                .messages()
                .await
                .map_err(transient)?,
        };

        let mut messages = Vec::new();
        while let Some(message) = batch.next().await {
            messages.push(message.map_err(transient)?);
        }
        Ok(messages)
    }
}

fn transient(error: impl std::fmt::Display) -> TransportError {
    TransportError::Transient(error.to_string())
}

fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        map.insert(key.as_str(), value.as_str());
    }
    map
}

fn from_header_map(map: Option<&HeaderMap>) -> Headers {
    let mut headers = Headers::new();
    if let Some(map) = map {
        for (key, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.as_str().to_string());
            }
        }
    }
    headers
}

fn to_delivery(message: jetstream::Message, deadline: Instant) -> Result<Delivery, TransportError> {
    let info = message.info().map_err(transient)?;
    let sequence = info.stream_sequence;
    let num_delivered = u32::try_from(info.delivered.max(1)).unwrap_or(u32::MAX);
    let nanos = info.published.unix_timestamp_nanos();
    let published_at = Utc.timestamp_nanos(i64::try_from(nanos).unwrap_or(i64::MAX));

    let converted = Message {
        subject: message.subject.to_string(),
        payload: message.payload.clone(),
        headers: from_header_map(message.headers.as_ref()),
        sequence,
        published_at,
    };

    Ok(Delivery {
        message: converted,
        num_delivered,
        acker: Box::new(NatsAcker {
            message,
            sequence,
            deadline,
        }),
    })
}

#[async_trait]
impl Transport for NatsTransport {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: spec.name.clone(),
                subjects: spec.subjects.clone(),
                storage: jetstream::stream::StorageType::File,
                duplicate_window: spec.duplicate_window,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Rejected(format!("stream {}: {e}", spec.name)))?;

        debug!(stream = %spec.name, subjects = ?spec.subjects, "Stream ready");
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck, TransportError> {
        self.ensure_open()?;
        let max = self.max_payload();
        if message.payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                size: message.payload.len(),
                max,
            });
        }

        let ack = self
            .jetstream
            .publish_with_headers(
                message.subject.clone(),
                to_header_map(&message.headers),
                message.payload,
            )
            .await
            .map_err(transient)?
            .await
            .map_err(|e| {
                let text = e.to_string();
                if text.contains("no responders") || text.contains("no stream") {
                    TransportError::NoStream {
                        subject: message.subject.clone(),
                    }
                } else {
                    TransportError::Transient(text)
                }
            })?;

        Ok(PublishAck {
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let key = (spec.stream.clone(), spec.durable.clone());
        if self.consumers.read().await.contains_key(&key) {
            return Ok(());
        }

        let stream = self
            .jetstream
            .get_stream(&spec.stream)
            .await
            .map_err(|e| TransportError::Rejected(format!("stream {}: {e}", spec.stream)))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &spec.durable,
                pull::Config {
                    durable_name: Some(spec.durable.clone()),
                    filter_subject: spec.filter_subject.clone(),
                    deliver_policy: jetstream::consumer::DeliverPolicy::All,
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: spec.ack_wait,
                    max_deliver: i64::from(spec.max_deliver),
                    max_ack_pending: i64::from(spec.max_ack_pending),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::Rejected(format!("consumer {}: {e}", spec.durable)))?;

        info!(stream = %spec.stream, durable = %spec.durable, "Durable consumer ready");
        self.consumers.write().await.insert(key, consumer);
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        self.ensure_open()?;
        let consumer = self.consumer(stream, durable).await?;

        // Take whatever is ready without waiting, otherwise block for the first message
        let mut messages = Self::pull(&consumer, max_messages, None).await?;
        if messages.is_empty() {
            messages = Self::pull(&consumer, 1, Some(expires)).await?;
        }

        let deadline = Instant::now() + consumer.cached_info().config.ack_wait;
        messages
            .into_iter()
            .map(|message| to_delivery(message, deadline))
            .collect()
    }

    fn max_payload(&self) -> usize {
        self.client.server_info().max_payload
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.consumers.write().await.clear();
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Flush on close failed");
        }
        Ok(())
    }
}

struct NatsAcker {
    message: jetstream::Message,
    sequence: u64,
    deadline: Instant,
}

impl NatsAcker {
    /// The server has already redelivered past `ack_wait`; a plain ack cannot tell.
    fn check_deadline(&self) -> Result<(), TransportError> {
        if Instant::now() >= self.deadline {
            return Err(TransportError::DeliveryExpired {
                sequence: self.sequence,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.check_deadline()?;
        self.message.ack().await.map_err(transient)
    }

    async fn nak(&self, delay: Duration) -> Result<(), TransportError> {
        self.check_deadline()?;
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(transient)
    }
}
