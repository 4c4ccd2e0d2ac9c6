//! # Durable consumer
//!
//! One worker task per subscription. The worker pulls batches from a durable
//! pull consumer, runs the handler on each delivery in fetch order, and settles
//! every delivery according to [`BackoffPolicy::decide`]:
//!
//! | Outcome | Transport | Metrics |
//! |---------|-----------|---------|
//! | success | ack | `acked` |
//! | failure, budget left | nak with backoff delay | `naked`, `redeliveries` |
//! | failure, budget spent | dead-letter write, then ack | `dead_lettered` |
//!
//! Backpressure is the transport's `max_ack_pending`: once that many deliveries
//! are unsettled the fetch returns nothing until the worker acks or naks.
//!
//! ## Ack-wait race
//!
//! The transport redelivers a message whose handler has not settled it within
//! `ack_wait`, even while that handler is still running. A handler that
//! overruns may therefore race a redelivered copy on another instance. The
//! cancellation token each handler receives fires at 90% of `ack_wait` so
//! cooperative handlers can bail out first; handlers that ignore it accept the
//! duplicate processing that at-least-once delivery implies.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use sentinel_telemetry::log_delivery_event;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::backoff::{BackoffPolicy, RetryAction};
use crate::config::{BusConfig, DlqFailurePolicy};
use crate::dead_letter::DeadLetterSink;
use crate::error::{BusError, TransportError};
use crate::message::DeliveryContext;
use crate::metrics::{InFlightGuard, MetricsCollector};
use crate::tracing_hooks::TracingHooks;
use crate::transport::{ConsumerSpec, Delivery, Transport};

/// Fraction of `ack_wait` after which the handler's token is cancelled.
const SOFT_DEADLINE_RATIO: f64 = 0.9;

/// Business logic run for each delivery.
///
/// Returning `Err` (or panicking) counts as a failure and feeds the retry
/// ladder. `cancel` fires when the subscription shuts down or the delivery
/// nears its ack deadline.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &DeliveryContext, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, delivery: &DeliveryContext, cancel: CancellationToken) -> anyhow::Result<()> {
        (**self).handle(delivery, cancel).await
    }
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`].
///
/// ```rust,ignore
/// let handler = handler_fn(|delivery, _cancel| async move {
///     let alert: Alert = serde_json::from_slice(&delivery.message.payload)?;
///     store(alert).await
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(DeliveryContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(DeliveryContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, delivery: &DeliveryContext, cancel: CancellationToken) -> anyhow::Result<()> {
        (self.f)(delivery.clone(), cancel).await
    }
}

/// Pull-consumer worker for one subscription.
pub struct DurableConsumer {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    dead_letters: Arc<DeadLetterSink>,
    metrics: Arc<MetricsCollector>,
    hooks: TracingHooks,
    policy: BackoffPolicy,
    spec: ConsumerSpec,
    batch_size: usize,
    fetch_expires: Duration,
    dlq_failure_policy: DlqFailurePolicy,
}

impl DurableConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        dead_letters: Arc<DeadLetterSink>,
        metrics: Arc<MetricsCollector>,
        hooks: TracingHooks,
        config: &BusConfig,
        spec: ConsumerSpec,
        batch_size: usize,
    ) -> Self {
        Self {
            transport,
            handler,
            dead_letters,
            metrics,
            hooks,
            policy: BackoffPolicy::from_config(config),
            spec,
            batch_size: batch_size.max(1),
            fetch_expires: config.fetch_expires,
            dlq_failure_policy: config.dlq_failure_policy,
        }
    }

    pub fn durable(&self) -> &str {
        &self.spec.durable
    }

    /// Create or attach to the transport-side durable consumer.
    pub async fn register(&self) -> Result<(), BusError> {
        self.transport.ensure_consumer(&self.spec).await?;
        Ok(())
    }

    /// Fetch and process until `shutdown` fires or the transport closes.
    ///
    /// Deliveries fetched but not yet handled when `shutdown` fires are left
    /// unacked for redelivery.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            durable = %self.spec.durable,
            filter = %self.spec.filter_subject,
            batch_size = self.batch_size,
            "Consumer started"
        );

        let mut fetch_failures = 0u32;
        while !shutdown.is_cancelled() {
            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                fetched = self.transport.fetch(
                    &self.spec.stream,
                    &self.spec.durable,
                    self.batch_size,
                    self.fetch_expires,
                ) => fetched,
            };

            match fetched {
                Ok(batch) => {
                    fetch_failures = 0;
                    let fetched_at = Instant::now();
                    let tracked: Vec<_> = batch
                        .into_iter()
                        .map(|delivery| (delivery, self.metrics.track_in_flight()))
                        .collect();

                    for (delivery, in_flight) in tracked {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        self.process(delivery, in_flight, fetched_at, &shutdown).await;
                    }
                }
                Err(TransportError::Closed) => {
                    debug!(durable = %self.spec.durable, "Transport closed");
                    break;
                }
                Err(e) => {
                    fetch_failures = fetch_failures.saturating_add(1);
                    let delay = self.policy.delay_for(fetch_failures);
                    warn!(
                        durable = %self.spec.durable,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(durable = %self.spec.durable, "Consumer stopped");
    }

    async fn process(
        &self,
        delivery: Delivery,
        _in_flight: InFlightGuard,
        fetched_at: Instant,
        shutdown: &CancellationToken,
    ) {
        let Delivery {
            message,
            num_delivered,
            acker,
        } = delivery;
        let ctx = DeliveryContext {
            message,
            num_delivered,
            consumer_durable_name: self.spec.durable.clone(),
            fetched_at,
            ack_deadline: fetched_at + self.spec.ack_wait,
        };

        if ctx.is_redelivery() {
            debug!(
                subject = %ctx.message.subject,
                sequence = ctx.message.sequence,
                num_delivered,
                "Redelivery"
            );
        }

        let span = self.hooks.consume_span(&ctx);
        let started = Instant::now();
        let outcome = self.invoke(&ctx, shutdown).instrument(span.clone()).await;
        self.hooks
            .record_outcome(&span, started.elapsed(), outcome.as_ref().err().map(String::as_str));

        if outcome.is_err() && shutdown.is_cancelled() {
            debug!(
                subject = %ctx.message.subject,
                sequence = ctx.message.sequence,
                "Handler failed during shutdown, leaving unacked"
            );
            return;
        }

        self.metrics.record_consume(end_to_end_ms(&ctx));

        let decision = self.policy.decide(outcome.is_ok(), num_delivered);
        let message = &ctx.message;
        match decision.action {
            RetryAction::Ack => match acker.ack().await {
                Ok(()) => self.metrics.record_ack(),
                Err(TransportError::DeliveryExpired { .. }) => warn!(
                    subject = %message.subject,
                    sequence = message.sequence,
                    num_delivered,
                    "Handler finished after ack_wait, message already queued for redelivery"
                ),
                Err(e) => warn!(subject = %message.subject, sequence = message.sequence, error = %e, "Ack failed"),
            },
            RetryAction::NakWithDelay(delay) => {
                log_delivery_event!(
                    debug,
                    "consumer",
                    "Handler failed, scheduling redelivery",
                    message.subject,
                    message.sequence,
                    num_delivered,
                    delay_ms = delay.as_millis() as u64,
                    reason = %decision.reason
                );
                match acker.nak(delay).await {
                    Ok(()) => {
                        self.metrics.record_nak();
                        self.metrics.record_redelivery();
                    }
                    Err(e) => warn!(subject = %message.subject, sequence = message.sequence, error = %e, "Nak failed"),
                }
            }
            RetryAction::DeadLetter => {
                let error = outcome.err().unwrap_or_default();
                match self
                    .dead_letters
                    .record(message, &error, num_delivered, &self.spec.durable)
                    .await
                {
                    Ok(_) => {
                        self.metrics.record_dead_letter();
                        if let Err(e) = acker.ack().await {
                            warn!(subject = %message.subject, sequence = message.sequence, error = %e, "Ack after dead-letter failed");
                        }
                    }
                    Err(e) => match self.dlq_failure_policy {
                        DlqFailurePolicy::WithholdAck => {
                            log_delivery_event!(
                                error,
                                "consumer",
                                "Dead-letter write failed, original left unacked",
                                message.subject,
                                message.sequence,
                                error = %e
                            );
                        }
                        DlqFailurePolicy::AckAndLog => {
                            log_delivery_event!(
                                error,
                                "consumer",
                                "Dead-letter write failed, acking original",
                                message.subject,
                                message.sequence,
                                error = %e,
                                handler_error = %error
                            );
                            if let Err(e) = acker.ack().await {
                                warn!(subject = %message.subject, sequence = message.sequence, error = %e, "Ack failed");
                            }
                        }
                    },
                }
            }
        }
    }

    /// Run the handler, turning errors and panics into an error string.
    async fn invoke(&self, ctx: &DeliveryContext, shutdown: &CancellationToken) -> Result<(), String> {
        let cancel = shutdown.child_token();
        let soft_deadline = ctx.fetched_at + self.spec.ack_wait.mul_f64(SOFT_DEADLINE_RATIO);

        let handler = AssertUnwindSafe(self.handler.handle(ctx, cancel.clone())).catch_unwind();
        tokio::pin!(handler);
        let watchdog = tokio::time::sleep_until(soft_deadline);
        tokio::pin!(watchdog);

        let result = loop {
            tokio::select! {
                result = &mut handler => break result,
                _ = &mut watchdog, if !cancel.is_cancelled() => {
                    debug!(sequence = ctx.message.sequence, "Ack deadline near, cancelling handler");
                    cancel.cancel();
                }
            }
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Publish-to-now latency in milliseconds.
fn end_to_end_ms(ctx: &DeliveryContext) -> f64 {
    (Utc::now() - ctx.message.published_at)
        .num_microseconds()
        .map(|us| us as f64 / 1000.0)
        .unwrap_or(0.0)
}
