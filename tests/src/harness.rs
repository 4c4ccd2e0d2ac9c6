//! Shared fixtures for the scenario suite.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sentinel_bus::{handler_fn, Bus, BusConfig, DeliveryContext, MemoryTransport, MessageHandler};

/// Topic used by most scenarios.
pub const TOPIC: &str = "alerts";

/// Default bus configuration over the in-process broker.
pub fn memory_config() -> BusConfig {
    BusConfig::new("memory://")
}

/// Connected bus attached to `broker`.
pub async fn connected_bus(config: BusConfig, broker: &MemoryTransport) -> Bus {
    let bus = Bus::with_memory_transport(config, broker);
    bus.connect().await.expect("memory bus connects");
    bus
}

/// Poll `condition` every 50ms until it holds, panicking after ~10 minutes
/// of (possibly virtual) time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..12_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

/// Record of every delivery a handler saw, keyed by stream sequence.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    seen: Arc<Mutex<Vec<(u64, u32)>>>,
}

impl DeliveryLog {
    pub fn record(&self, delivery: &DeliveryContext) {
        self.seen
            .lock()
            .push((delivery.message.sequence, delivery.num_delivered));
    }

    /// `(sequence, num_delivered)` in the order handled.
    pub fn entries(&self) -> Vec<(u64, u32)> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// How many times each sequence was handled.
    pub fn counts(&self) -> HashMap<u64, usize> {
        let mut counts = HashMap::new();
        for (sequence, _) in self.seen.lock().iter() {
            *counts.entry(*sequence).or_insert(0) += 1;
        }
        counts
    }

    /// Handler that logs and succeeds.
    pub fn acking_handler(&self) -> impl MessageHandler + 'static {
        let log = self.clone();
        handler_fn(move |delivery, _cancel| {
            log.record(&delivery);
            async { Ok(()) }
        })
    }

    /// Handler that logs and always fails with `error`.
    pub fn failing_handler(&self, error: &'static str) -> impl MessageHandler + 'static {
        let log = self.clone();
        handler_fn(move |delivery, _cancel| {
            log.record(&delivery);
            async move { Err(anyhow::anyhow!(error)) }
        })
    }
}
