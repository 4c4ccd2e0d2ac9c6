//! In-process broker with JetStream delivery semantics.
//!
//! One [`MemoryTransport`] value is one client connection. [`MemoryTransport::connect`]
//! opens another connection to the same broker, which is how tests model a
//! consumer process crashing and coming back: the durable cursor, pending
//! deliveries and delivery counts live in the broker, not in the connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Acker, ConsumerSpec, Delivery, PublishAck, StreamSpec, Transport};
use crate::error::TransportError;
use crate::message::{subject_matches, Message, OutboundMessage, HEADER_MSG_ID};

/// Default message size limit, matching the NATS server default.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Point-in-time view of one durable consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Stream messages matching the filter not yet delivered
    pub num_pending: u64,
    /// Deliveries handed out and not yet acked or naked
    pub num_ack_pending: usize,
    /// Messages waiting for a (delayed) redelivery
    pub num_redelivery_pending: usize,
    pub num_acked: u64,
    /// Messages that reached `max_deliver` and will not be delivered again
    pub num_exhausted: u64,
    /// Every nak delay requested, in order
    pub nak_delays: Vec<Duration>,
}

struct StoredStream {
    spec: StreamSpec,
    messages: BTreeMap<u64, Message>,
    last_sequence: u64,
    msg_ids: HashMap<String, (u64, Instant)>,
}

struct Pending {
    token: u64,
    num_delivered: u32,
    deadline: Instant,
}

struct StoredConsumer {
    spec: ConsumerSpec,
    /// Highest stream sequence considered for first delivery
    cursor: u64,
    pending: BTreeMap<u64, Pending>,
    /// Sequence -> earliest redelivery time
    redeliver: BTreeMap<u64, Instant>,
    delivery_counts: HashMap<u64, u32>,
    acked: u64,
    exhausted: u64,
    nak_delays: Vec<Duration>,
}

impl StoredConsumer {
    fn new(spec: ConsumerSpec) -> Self {
        Self {
            spec,
            cursor: 0,
            pending: BTreeMap::new(),
            redeliver: BTreeMap::new(),
            delivery_counts: HashMap::new(),
            acked: 0,
            exhausted: 0,
            nak_delays: Vec::new(),
        }
    }

    /// Move deliveries whose ack deadline passed back to redelivery.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in expired {
            if let Some(pending) = self.pending.remove(&seq) {
                self.schedule_redelivery(seq, pending.num_delivered, now);
            }
        }
    }

    fn schedule_redelivery(&mut self, sequence: u64, num_delivered: u32, at: Instant) {
        if num_delivered >= self.spec.max_deliver {
            self.exhausted += 1;
            self.delivery_counts.remove(&sequence);
        } else {
            self.redeliver.insert(sequence, at);
        }
    }

    /// Earliest future instant at which something may become deliverable.
    fn next_wake(&self) -> Option<Instant> {
        let deadlines = self.pending.values().map(|p| p.deadline);
        let redeliveries = self.redeliver.values().copied();
        deadlines.chain(redeliveries).min()
    }
}

struct BrokerState {
    streams: HashMap<String, StoredStream>,
    consumers: HashMap<(String, String), StoredConsumer>,
    next_token: u64,
    max_payload: usize,
    fail_next: u32,
    fail_matching: Vec<(String, u32)>,
}

impl BrokerState {
    fn injected_failure(&mut self, subject: &str) -> Option<TransportError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Some(TransportError::Transient("injected publish failure".into()));
        }
        let rule = self
            .fail_matching
            .iter_mut()
            .find(|(prefix, remaining)| *remaining > 0 && subject.starts_with(prefix.as_str()))?;
        rule.1 -= 1;
        Some(TransportError::Transient(format!(
            "injected publish failure for {subject}"
        )))
    }

    /// Hand out up to `max` deliverable messages, redeliveries first.
    fn take_deliveries(
        &mut self,
        stream: &str,
        durable: &str,
        max: usize,
        now: Instant,
    ) -> Result<(Vec<(Message, u32, u64)>, Option<Instant>), TransportError> {
        let Self {
            streams,
            consumers,
            next_token,
            ..
        } = self;

        let stored = streams.get(stream).ok_or_else(|| TransportError::NoStream {
            subject: stream.to_string(),
        })?;
        let consumer = consumers
            .get_mut(&(stream.to_string(), durable.to_string()))
            .ok_or_else(|| TransportError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })?;

        consumer.expire(now);

        let capacity = (consumer.spec.max_ack_pending as usize).saturating_sub(consumer.pending.len());
        let mut batch = Vec::new();
        let limit = max.min(capacity);

        let ready: Vec<u64> = consumer
            .redeliver
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(seq, _)| *seq)
            .take(limit)
            .collect();
        for seq in ready {
            consumer.redeliver.remove(&seq);
            if let Some(message) = stored.messages.get(&seq) {
                batch.push(seq_delivery(consumer, message, next_token, now));
            }
        }

        if batch.len() < limit {
            let fresh: Vec<u64> = stored
                .messages
                .range(consumer.cursor + 1..)
                .filter(|(_, m)| subject_matches(&consumer.spec.filter_subject, &m.subject))
                .map(|(seq, _)| *seq)
                .take(limit - batch.len())
                .collect();

            if fresh.len() < limit - batch.len() {
                // Nothing matching remains past the tail
                consumer.cursor = stored.last_sequence;
            }
            for seq in fresh {
                consumer.cursor = consumer.cursor.max(seq);
                if let Some(message) = stored.messages.get(&seq) {
                    batch.push(seq_delivery(consumer, message, next_token, now));
                }
            }
        }

        Ok((batch, consumer.next_wake()))
    }
}

fn seq_delivery(
    consumer: &mut StoredConsumer,
    message: &Message,
    next_token: &mut u64,
    now: Instant,
) -> (Message, u32, u64) {
    let count = consumer.delivery_counts.entry(message.sequence).or_insert(0);
    *count += 1;
    let num_delivered = *count;

    *next_token += 1;
    consumer.pending.insert(
        message.sequence,
        Pending {
            token: *next_token,
            num_delivered,
            deadline: now + consumer.spec.ack_wait,
        },
    );
    (message.clone(), num_delivered, *next_token)
}

struct Broker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// Connection to an in-process broker.
#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<Broker>,
    closed: Arc<AtomicBool>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Start a new, empty broker and return a connection to it.
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker {
                state: Mutex::new(BrokerState {
                    streams: HashMap::new(),
                    consumers: HashMap::new(),
                    next_token: 0,
                    max_payload: DEFAULT_MAX_PAYLOAD,
                    fail_next: 0,
                    fail_matching: Vec::new(),
                }),
                notify: Notify::new(),
            }),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open another connection to the same broker.
    pub fn connect(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn consumer_info(&self, stream: &str, durable: &str) -> Option<ConsumerInfo> {
        let state = self.broker.state.lock();
        let consumer = state
            .consumers
            .get(&(stream.to_string(), durable.to_string()))?;
        let stored = state.streams.get(stream)?;

        let num_pending = stored
            .messages
            .range(consumer.cursor + 1..)
            .filter(|(_, m)| subject_matches(&consumer.spec.filter_subject, &m.subject))
            .count() as u64;

        Some(ConsumerInfo {
            num_pending,
            num_ack_pending: consumer.pending.len(),
            num_redelivery_pending: consumer.redeliver.len(),
            num_acked: consumer.acked,
            num_exhausted: consumer.exhausted,
            nak_delays: consumer.nak_delays.clone(),
        })
    }

    /// All messages stored in a stream, in sequence order.
    pub fn stream_messages(&self, stream: &str) -> Vec<Message> {
        self.broker
            .state
            .lock()
            .streams
            .get(stream)
            .map(|s| s.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.broker.state.lock().fail_next = n;
    }

    /// Fail the next `n` publishes to subjects starting with `prefix`.
    pub fn fail_publishes_matching(&self, prefix: &str, n: u32) {
        self.broker
            .state
            .lock()
            .fail_matching
            .push((prefix.to_string(), n));
    }

    pub fn set_max_payload(&self, bytes: usize) {
        self.broker.state.lock().max_payload = bytes;
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();

        let overlapping = state.streams.values().any(|s| {
            s.spec.name != spec.name
                && s.spec.subjects.iter().any(|existing| spec.subjects.contains(existing))
        });
        if overlapping {
            return Err(TransportError::Rejected(format!(
                "subjects of stream {} overlap an existing stream",
                spec.name
            )));
        }

        state
            .streams
            .entry(spec.name.clone())
            .or_insert_with(|| StoredStream {
                spec: spec.clone(),
                messages: BTreeMap::new(),
                last_sequence: 0,
                msg_ids: HashMap::new(),
            });
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishAck, TransportError> {
        self.ensure_open()?;
        let now = Instant::now();

        let ack = {
            let mut state = self.broker.state.lock();
            if let Some(error) = state.injected_failure(&message.subject) {
                return Err(error);
            }
            if message.payload.len() > state.max_payload {
                return Err(TransportError::PayloadTooLarge {
                    size: message.payload.len(),
                    max: state.max_payload,
                });
            }

            let stream = state
                .streams
                .values_mut()
                .find(|s| {
                    s.spec
                        .subjects
                        .iter()
                        .any(|pattern| subject_matches(pattern, &message.subject))
                })
                .ok_or_else(|| TransportError::NoStream {
                    subject: message.subject.clone(),
                })?;

            let window = stream.spec.duplicate_window;
            stream
                .msg_ids
                .retain(|_, (_, at)| now.duration_since(*at) < window);

            let msg_id = message.headers.get(HEADER_MSG_ID).cloned();
            if let Some((sequence, _)) = msg_id.as_ref().and_then(|id| stream.msg_ids.get(id)) {
                return Ok(PublishAck {
                    sequence: *sequence,
                    duplicate: true,
                });
            }

            stream.last_sequence += 1;
            let sequence = stream.last_sequence;
            if let Some(id) = msg_id {
                stream.msg_ids.insert(id, (sequence, now));
            }
            stream.messages.insert(
                sequence,
                Message {
                    subject: message.subject,
                    payload: message.payload,
                    headers: message.headers,
                    sequence,
                    published_at: Utc::now(),
                },
            );
            PublishAck {
                sequence,
                duplicate: false,
            }
        };

        self.broker.notify.notify_waiters();
        Ok(ack)
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.streams.contains_key(&spec.stream) {
            return Err(TransportError::Rejected(format!(
                "stream {} does not exist",
                spec.stream
            )));
        }
        state
            .consumers
            .entry((spec.stream.clone(), spec.durable.clone()))
            .or_insert_with(|| StoredConsumer::new(spec.clone()));
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let deadline = Instant::now() + expires;

        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                self.ensure_open()?;
                let mut state = self.broker.state.lock();
                let (batch, next_wake) =
                    state.take_deliveries(stream, durable, max_messages, Instant::now())?;

                if !batch.is_empty() {
                    return Ok(batch
                        .into_iter()
                        .map(|(message, num_delivered, token)| Delivery {
                            acker: Box::new(MemoryAcker {
                                broker: Arc::clone(&self.broker),
                                closed: Arc::clone(&self.closed),
                                stream: stream.to_string(),
                                durable: durable.to_string(),
                                sequence: message.sequence,
                                token,
                            }),
                            message,
                            num_delivered,
                        })
                        .collect());
                }
                next_wake.map_or(deadline, |wake| wake.min(deadline))
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    fn max_payload(&self) -> usize {
        self.broker.state.lock().max_payload
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryAcker {
    broker: Arc<Broker>,
    closed: Arc<AtomicBool>,
    stream: String,
    durable: String,
    sequence: u64,
    token: u64,
}

impl MemoryAcker {
    fn settle(&self, nak: Option<Duration>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        {
            let mut state = self.broker.state.lock();
            let consumer = state
                .consumers
                .get_mut(&(self.stream.clone(), self.durable.clone()))
                .ok_or_else(|| TransportError::ConsumerNotFound {
                    stream: self.stream.clone(),
                    durable: self.durable.clone(),
                })?;

            // Past its deadline the delivery is requeued even if no fetch ran since
            consumer.expire(Instant::now());
            let pending = match consumer.pending.remove(&self.sequence) {
                Some(pending) if pending.token == self.token => pending,
                Some(other) => {
                    consumer.pending.insert(self.sequence, other);
                    return Err(TransportError::DeliveryExpired {
                        sequence: self.sequence,
                    });
                }
                None => {
                    return Err(TransportError::DeliveryExpired {
                        sequence: self.sequence,
                    })
                }
            };

            match nak {
                None => {
                    consumer.acked += 1;
                    consumer.delivery_counts.remove(&self.sequence);
                }
                Some(delay) => {
                    consumer.nak_delays.push(delay);
                    consumer.schedule_redelivery(
                        self.sequence,
                        pending.num_delivered,
                        Instant::now() + delay,
                    );
                }
            }
        }

        self.broker.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(None)
    }

    async fn nak(&self, delay: Duration) -> Result<(), TransportError> {
        self.settle(Some(delay))
    }
}
