//! # Bus
//!
//! The only surface other components use. A [`Bus`] owns the transport
//! connection, the shared [`MetricsCollector`] and every subscription worker.
//!
//! ```rust,ignore
//! let bus = Bus::new(BusConfig::from_env()?);
//! bus.connect().await?;
//!
//! let handle = bus
//!     .subscribe("alerts", "triage", handler_fn(|delivery, _cancel| async move {
//!         triage(&delivery.message.payload).await
//!     }))
//!     .await?;
//!
//! bus.emit("alerts", serde_json::to_vec(&alert)?).await?;
//!
//! bus.unsubscribe(&handle).await;
//! bus.disconnect().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use sentinel_telemetry::{component_span, log_event};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::config::{BusConfig, TransportKind};
use crate::consumer::{DurableConsumer, MessageHandler};
use crate::dead_letter::DeadLetterSink;
use crate::error::BusError;
use crate::message::Headers;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::publisher::Publisher;
use crate::tracing_hooks::TracingHooks;
use crate::transport::{ConsumerSpec, MemoryTransport, NatsTransport, StreamSpec, Transport};

/// Per-subscription overrides of the bus-wide consumer settings.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub fetch_batch_size: Option<u32>,
    pub max_ack_pending: Option<u32>,
}

/// Identifies one subscription for [`Bus::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    /// Transport-side durable name
    pub durable: String,
    pub filter_subject: String,
}

enum TransportSource {
    Nats,
    /// Each connect opens a fresh connection to the same broker
    Memory(MemoryTransport),
    Provided(Arc<dyn Transport>),
}

struct Connection {
    transport: Arc<dyn Transport>,
    publisher: Arc<Publisher>,
    dead_letters: Arc<DeadLetterSink>,
}

struct Subscription {
    durable: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BusState {
    connection: Option<Connection>,
    subscriptions: HashMap<u64, Subscription>,
    /// Set while `disconnect` waits for workers; new subscriptions are refused
    draining: bool,
}

/// Durable event bus facade.
pub struct Bus {
    config: Arc<BusConfig>,
    source: TransportSource,
    metrics: Arc<MetricsCollector>,
    hooks: TracingHooks,
    state: Mutex<BusState>,
    /// Serializes connect and disconnect
    lifecycle: Mutex<()>,
    next_subscription: AtomicU64,
}

impl Bus {
    /// Bus for `config.transport_url`.
    ///
    /// A `memory://` URL gets a private in-process broker that lives as long
    /// as the bus, so reconnecting keeps stored messages and consumer cursors.
    pub fn new(config: BusConfig) -> Self {
        let source = match config.transport_kind() {
            Ok(TransportKind::Memory) => TransportSource::Memory(MemoryTransport::new()),
            _ => TransportSource::Nats,
        };
        Self::with_source(config, source)
    }

    /// Bus attached to an existing in-process broker.
    pub fn with_memory_transport(config: BusConfig, broker: &MemoryTransport) -> Self {
        Self::with_source(config, TransportSource::Memory(broker.clone()))
    }

    /// Bus over a caller-supplied transport. The transport is closed on
    /// [`Bus::disconnect`] and reused as-is by a later [`Bus::connect`].
    pub fn with_transport(config: BusConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_source(config, TransportSource::Provided(transport))
    }

    fn with_source(config: BusConfig, source: TransportSource) -> Self {
        Self {
            metrics: Arc::new(MetricsCollector::new(config.latency_window)),
            hooks: TracingHooks::new(config.tracing_enabled),
            config: Arc::new(config),
            source,
            state: Mutex::new(BusState::default()),
            lifecycle: Mutex::new(()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Validate configuration, open the transport and ensure both streams exist.
    ///
    /// Connecting an already connected bus is a no-op.
    pub async fn connect(&self) -> Result<(), BusError> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut state = self.state.lock().await;
        if state.connection.is_some() {
            return Ok(());
        }

        self.config.validate()?;
        let transport = self.open_transport().await?;

        let streams = [
            StreamSpec::new(
                self.config.stream_name(),
                vec![format!("{}.>", self.config.stream_name())],
            ),
            StreamSpec::new(
                self.config.dlq_stream_name(),
                vec![format!("{}.>", self.config.dlq_stream_name())],
            ),
        ];
        for spec in &streams {
            if let Err(e) = transport.ensure_stream(spec).await {
                if let Err(close_err) = transport.close().await {
                    debug!(error = %close_err, "Close after failed connect");
                }
                return Err(e.into());
            }
        }

        let publisher = Arc::new(Publisher::new(
            Arc::clone(&transport),
            &self.config,
            Arc::clone(&self.metrics),
            self.hooks,
        ));
        let dead_letters = Arc::new(DeadLetterSink::new(
            Arc::clone(&publisher),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
        ));

        state.connection = Some(Connection {
            transport,
            publisher,
            dead_letters,
        });

        log_event!(
            info,
            "bus",
            "Bus connected",
            url = %self.config.transport_url,
            stream = %self.config.stream_name()
        );
        Ok(())
    }

    async fn open_transport(&self) -> Result<Arc<dyn Transport>, BusError> {
        Ok(match &self.source {
            TransportSource::Nats => Arc::new(NatsTransport::connect(&self.config).await?),
            TransportSource::Memory(broker) => Arc::new(broker.connect()),
            TransportSource::Provided(transport) => Arc::clone(transport),
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connection.is_some()
    }

    /// Stop every subscription and close the transport.
    ///
    /// Workers get `shutdown_grace` to finish their in-flight handler; workers
    /// still running after that are aborted, leaving their deliveries unacked.
    /// The connection stays open until the workers are joined, so handlers can
    /// still emit and settle while they finish. Calling this on a disconnected
    /// bus does nothing.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let subscriptions: Vec<Subscription> = {
            let mut state = self.state.lock().await;
            if state.connection.is_none() {
                return;
            }
            state.draining = true;
            state.subscriptions.drain().map(|(_, s)| s).collect()
        };

        for subscription in &subscriptions {
            subscription.shutdown.cancel();
        }
        let deadline = Instant::now() + self.config.shutdown_grace;
        for subscription in subscriptions {
            join_subscription(subscription, deadline).await;
        }

        let connection = {
            let mut state = self.state.lock().await;
            state.draining = false;
            state.connection.take()
        };
        if let Some(connection) = connection {
            if let Err(e) = connection.transport.close().await {
                warn!(error = %e, "Transport close failed");
            }
        }
        log_event!(info, "bus", "Bus disconnected");
    }

    /// Publish `payload` on `topic` and return its stream sequence.
    pub async fn emit(&self, topic: &str, payload: impl Into<Bytes>) -> Result<u64, BusError> {
        self.emit_with_headers(topic, payload, Headers::new()).await
    }

    pub async fn emit_with_headers(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        headers: Headers,
    ) -> Result<u64, BusError> {
        let publisher = self.connection(|c| Arc::clone(&c.publisher)).await?;
        publisher
            .emit(&self.config.subject_for(topic), payload.into(), headers)
            .await
    }

    /// Start a worker consuming `topic` under the durable `durable_name`.
    ///
    /// Subscribing several times with the same durable name, on this bus or
    /// others, makes the workers compete for deliveries.
    pub async fn subscribe<H>(
        &self,
        topic: &str,
        durable_name: &str,
        handler: H,
    ) -> Result<SubscriptionHandle, BusError>
    where
        H: MessageHandler + 'static,
    {
        self.subscribe_with(topic, durable_name, handler, SubscribeOptions::default())
            .await
    }

    pub async fn subscribe_with<H>(
        &self,
        topic: &str,
        durable_name: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError>
    where
        H: MessageHandler + 'static,
    {
        if topic.trim().is_empty() {
            return Err(BusError::InvalidSubject {
                subject: topic.to_string(),
                reason: "empty topic",
            });
        }

        let mut state = self.state.lock().await;
        if state.draining {
            return Err(BusError::NotConnected);
        }
        let connection = state.connection.as_ref().ok_or(BusError::NotConnected)?;

        let spec = ConsumerSpec {
            stream: self.config.stream_name(),
            durable: self.config.durable_for(durable_name),
            filter_subject: self.config.subject_for(topic),
            ack_wait: self.config.ack_wait,
            max_deliver: self.config.max_deliver,
            max_ack_pending: options.max_ack_pending.unwrap_or(self.config.max_ack_pending),
        };
        let batch_size = options.fetch_batch_size.unwrap_or(self.config.fetch_batch_size) as usize;

        let consumer = DurableConsumer::new(
            Arc::clone(&connection.transport),
            Arc::new(handler),
            Arc::clone(&connection.dead_letters),
            Arc::clone(&self.metrics),
            self.hooks,
            &self.config,
            spec.clone(),
            batch_size,
        );
        consumer.register().await?;

        let shutdown = CancellationToken::new();
        let span = component_span!(
            "bus.subscription",
            durable = %spec.durable,
            filter = %spec.filter_subject
        );
        let task = tokio::spawn(consumer.run(shutdown.clone()).instrument(span));

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        state.subscriptions.insert(
            id,
            Subscription {
                durable: spec.durable.clone(),
                shutdown,
                task,
            },
        );

        log_event!(
            info,
            "bus",
            "Subscribed",
            durable = %spec.durable,
            filter = %spec.filter_subject,
            batch_size
        );
        Ok(SubscriptionHandle {
            id,
            durable: spec.durable,
            filter_subject: spec.filter_subject,
        })
    }

    /// Stop one subscription with the same grace rules as [`Bus::disconnect`].
    ///
    /// Returns `false` if the handle is unknown or already stopped.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Some(subscription) = self.state.lock().await.subscriptions.remove(&handle.id) else {
            return false;
        };
        subscription.shutdown.cancel();
        join_subscription(subscription, Instant::now() + self.config.shutdown_grace).await;
        true
    }

    /// Number of running subscription workers.
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    /// Re-emit up to `max` dead letters of `topic` to their original subject.
    pub async fn redrive_dead_letters(&self, topic: &str, max: usize) -> Result<usize, BusError> {
        let (transport, dead_letters) = self
            .connection(|c| (Arc::clone(&c.transport), Arc::clone(&c.dead_letters)))
            .await?;
        let redriven = dead_letters.redrive(transport.as_ref(), topic, max).await?;
        log_event!(info, "bus", "Dead letters redriven", topic, redriven);
        Ok(redriven)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared collector, for callers that need in-flight or failure counts.
    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    async fn connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> Result<T, BusError> {
        self.state
            .lock()
            .await
            .connection
            .as_ref()
            .map(f)
            .ok_or(BusError::NotConnected)
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        // Workers outliving the bus stop at their next fetch
        if let Ok(state) = self.state.try_lock() {
            for subscription in state.subscriptions.values() {
                subscription.shutdown.cancel();
            }
        }
    }
}

async fn join_subscription(subscription: Subscription, deadline: Instant) {
    let Subscription { durable, task, .. } = subscription;
    let abort = task.abort_handle();
    match tokio::time::timeout_at(deadline, task).await {
        Ok(Ok(())) => debug!(durable = %durable, "Subscription stopped"),
        Ok(Err(e)) => warn!(durable = %durable, error = %e, "Subscription worker failed"),
        Err(_) => {
            abort.abort();
            warn!(durable = %durable, "Subscription did not stop within grace period, aborted");
        }
    }
}
