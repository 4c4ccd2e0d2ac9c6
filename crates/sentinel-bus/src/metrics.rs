//! Delivery metrics.
//!
//! [`MetricsCollector`] is shared by every publisher and consumer worker of one
//! [`Bus`](crate::Bus). Counters are atomics updated under a shared read lock;
//! [`MetricsCollector::snapshot`] takes the exclusive side of the same lock so
//! a snapshot never observes a half-applied update.
//!
//! Every update is mirrored to the process-wide Prometheus series in
//! `sentinel-telemetry`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let metrics = MetricsCollector::new(2048);
//! metrics.record_publish();
//! metrics.record_consume(12.5);
//! metrics.record_ack();
//!
//! let snapshot = metrics.snapshot();
//! println!("{}", snapshot.to_json());
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sentinel_telemetry::{metric_inc, metric_observe, metrics as prom};

/// Point-in-time copy of the delivery counters.
///
/// The JSON shape is consumed by external load-test tooling; keep it field-stable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub consumed: u64,
    pub acked: u64,
    pub naked: u64,
    pub dead_lettered: u64,
    pub redeliveries: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub max_lag: u64,
}

impl MetricsSnapshot {
    /// Render as the field-stable JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Bounded ring of recent latency samples.
struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    /// Nearest-rank percentiles for each requested quantile.
    fn percentiles<const N: usize>(&self, quantiles: [f64; N]) -> [f64; N] {
        let mut out = [0.0; N];
        if self.samples.is_empty() {
            return out;
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        for (slot, q) in out.iter_mut().zip(quantiles) {
            let rank = (q * sorted.len() as f64 - 1e-9).ceil() as usize;
            *slot = sorted[rank.clamp(1, sorted.len()) - 1];
        }
        out
    }
}

/// Thread-safe delivery metrics.
pub struct MetricsCollector {
    /// Read side for updates, write side for snapshots
    gate: RwLock<()>,
    published: AtomicU64,
    consumed: AtomicU64,
    acked: AtomicU64,
    naked: AtomicU64,
    dead_lettered: AtomicU64,
    redeliveries: AtomicU64,
    dead_letter_write_failures: AtomicU64,
    in_flight: AtomicU64,
    max_lag: AtomicU64,
    latencies: Mutex<LatencyWindow>,
}

impl MetricsCollector {
    /// Create a collector keeping the last `latency_window` latency samples.
    pub fn new(latency_window: usize) -> Self {
        Self {
            gate: RwLock::new(()),
            published: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            naked: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            redeliveries: AtomicU64::new(0),
            dead_letter_write_failures: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_lag: AtomicU64::new(0),
            latencies: Mutex::new(LatencyWindow::new(latency_window)),
        }
    }

    /// Count an append the transport already stored.
    pub fn record_publish(&self) {
        self.reserve_publish();
        self.confirm_publish();
    }

    /// Count a publish before its append; settle with `confirm_publish` or `revert_publish`.
    pub(crate) fn reserve_publish(&self) {
        let _gate = self.gate.read();
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// The reserved append was stored. Only now does the Prometheus series move.
    pub(crate) fn confirm_publish(&self) {
        metric_inc!(prom::MESSAGES_PUBLISHED);
    }

    /// Roll back a `reserve_publish` whose append did not happen.
    pub(crate) fn revert_publish(&self) {
        let _gate = self.gate.read();
        self.published.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a handled delivery with its publish-to-completion latency.
    pub fn record_consume(&self, latency_ms: f64) {
        let latency_ms = if latency_ms.is_finite() { latency_ms.max(0.0) } else { 0.0 };
        let _gate = self.gate.read();
        self.consumed.fetch_add(1, Ordering::Relaxed);
        self.latencies.lock().push(latency_ms);
        metric_inc!(prom::MESSAGES_CONSUMED);
        metric_observe!(prom::DELIVERY_LATENCY, latency_ms / 1000.0);
    }

    pub fn record_ack(&self) {
        let _gate = self.gate.read();
        self.acked.fetch_add(1, Ordering::Relaxed);
        metric_inc!(prom::MESSAGES_ACKED);
    }

    pub fn record_nak(&self) {
        let _gate = self.gate.read();
        self.naked.fetch_add(1, Ordering::Relaxed);
        metric_inc!(prom::MESSAGES_NAKED);
    }

    pub fn record_dead_letter(&self) {
        let _gate = self.gate.read();
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        metric_inc!(prom::MESSAGES_DEAD_LETTERED);
    }

    pub fn record_redelivery(&self) {
        let _gate = self.gate.read();
        self.redeliveries.fetch_add(1, Ordering::Relaxed);
        metric_inc!(prom::REDELIVERIES);
    }

    pub fn record_dead_letter_failure(&self) {
        let _gate = self.gate.read();
        self.dead_letter_write_failures.fetch_add(1, Ordering::Relaxed);
        metric_inc!(prom::DEAD_LETTER_WRITE_FAILURES);
    }

    /// Dead-letter writes that failed after retries.
    pub fn dead_letter_write_failures(&self) -> u64 {
        self.dead_letter_write_failures.load(Ordering::Relaxed)
    }

    /// Deliveries fetched and not yet settled.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Mark one delivery as in flight until the returned guard drops.
    pub fn track_in_flight(self: &Arc<Self>) -> InFlightGuard {
        {
            let _gate = self.gate.read();
            let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
            self.max_lag.fetch_max(current, Ordering::Relaxed);
        }
        metric_inc!(prom::IN_FLIGHT);
        InFlightGuard {
            metrics: Arc::clone(self),
        }
    }

    /// Consistent point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let _gate = self.gate.write();
        let [p50, p95, p99] = self.latencies.lock().percentiles([0.50, 0.95, 0.99]);

        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            naked: self.naked.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            max_lag: self.max_lag.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(2048)
    }
}

/// Decrements the in-flight count on drop, however the delivery ends.
pub struct InFlightGuard {
    metrics: Arc<MetricsCollector>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        {
            let _gate = self.metrics.gate.read();
            self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
        prom::IN_FLIGHT.dec();
    }
}
