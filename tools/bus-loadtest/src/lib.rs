//! Load and replay runs against a connected [`Bus`].
//!
//! A run subscribes `consumers` competing workers under one durable name,
//! publishes `messages` payloads at a bounded rate, then waits until every
//! published message has settled (acked or dead-lettered).

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use sentinel_bus::{handler_fn, Bus, MetricsSnapshot, SubscribeOptions};
use tokio::time::Instant;
use tracing::{info, warn};

/// Parameters of one load run.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub topic: String,
    pub durable: String,
    pub messages: u64,
    /// Messages per second; `0` publishes as fast as the transport allows
    pub rate_per_sec: f64,
    pub payload_size: usize,
    /// Probability that a handler call fails
    pub fail_ratio: f64,
    pub consumers: usize,
    pub subscribe: SubscribeOptions,
    pub drain_timeout: Duration,
    /// Re-emit dead letters once the run has drained
    pub redrive: bool,
}

impl Default for LoadPlan {
    fn default() -> Self {
        Self {
            topic: "loadtest".to_string(),
            durable: "loadtest".to_string(),
            messages: 5000,
            rate_per_sec: 1000.0,
            payload_size: 256,
            fail_ratio: 0.0,
            consumers: 1,
            subscribe: SubscribeOptions::default(),
            drain_timeout: Duration::from_secs(120),
            redrive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub metrics: MetricsSnapshot,
    pub publish_errors: u64,
    pub publish_elapsed_ms: u64,
    pub achieved_rate: f64,
    pub drained: bool,
    pub redriven: usize,
}

/// Execute `plan` on an already connected bus.
pub async fn run(bus: &Bus, plan: &LoadPlan) -> anyhow::Result<LoadReport> {
    let fail_ratio = plan.fail_ratio.clamp(0.0, 1.0);

    let mut handles = Vec::with_capacity(plan.consumers);
    for _ in 0..plan.consumers.max(1) {
        let handler = handler_fn(move |_delivery, _cancel| async move {
            if rand::thread_rng().gen_bool(fail_ratio) {
                anyhow::bail!("injected failure");
            }
            Ok(())
        });
        handles.push(
            bus.subscribe_with(&plan.topic, &plan.durable, handler, plan.subscribe.clone())
                .await?,
        );
    }

    let (publish_errors, publish_elapsed) = publish(bus, plan).await;
    let drained = wait_for_drain(bus, plan.drain_timeout).await;
    if !drained {
        warn!(timeout_secs = plan.drain_timeout.as_secs(), "Run did not drain before timeout");
    }

    for handle in &handles {
        bus.unsubscribe(handle).await;
    }

    let redriven = if plan.redrive {
        bus.redrive_dead_letters(&plan.topic, plan.messages as usize).await?
    } else {
        0
    };

    let published = plan.messages.saturating_sub(publish_errors);
    let secs = publish_elapsed.as_secs_f64();
    Ok(LoadReport {
        metrics: bus.metrics(),
        publish_errors,
        publish_elapsed_ms: publish_elapsed.as_millis() as u64,
        achieved_rate: if secs > 0.0 { published as f64 / secs } else { published as f64 },
        drained,
        redriven,
    })
}

async fn publish(bus: &Bus, plan: &LoadPlan) -> (u64, Duration) {
    let interval = (plan.rate_per_sec > 0.0).then(|| Duration::from_secs_f64(1.0 / plan.rate_per_sec));
    let padding = "x".repeat(plan.payload_size.saturating_sub(32));
    let started = Instant::now();
    let mut errors = 0;

    for seq in 0..plan.messages {
        if let Some(interval) = interval {
            tokio::time::sleep_until(started + interval.mul_f64(seq as f64)).await;
        }
        let payload = serde_json::json!({ "seq": seq, "pad": padding }).to_string();
        if let Err(e) = bus.emit(&plan.topic, payload).await {
            errors += 1;
            warn!(seq, error = %e, "Publish failed");
        }
    }

    let elapsed = started.elapsed();
    info!(
        messages = plan.messages,
        errors,
        elapsed_ms = elapsed.as_millis() as u64,
        "Publishing finished"
    );
    (errors, elapsed)
}

/// Wait until every published message is acked or dead-lettered.
async fn wait_for_drain(bus: &Bus, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = bus.metrics();
        if snapshot.acked + snapshot.dead_lettered >= snapshot.published {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_bus::BusConfig;

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_on_memory_transport() {
        let bus = Bus::new(BusConfig::new("memory://"));
        bus.connect().await.unwrap();

        let plan = LoadPlan {
            messages: 200,
            rate_per_sec: 0.0,
            consumers: 2,
            ..LoadPlan::default()
        };
        let report = run(&bus, &plan).await.unwrap();

        assert!(report.drained);
        assert_eq!(report.publish_errors, 0);
        assert_eq!(report.metrics.published, 200);
        assert_eq!(report.metrics.acked, 200);
        assert!(report.metrics.max_lag <= 256 + 10);
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_dead_letter_and_redrive() {
        let mut config = BusConfig::new("memory://");
        config.max_deliver = 2;
        let bus = Bus::new(config);
        bus.connect().await.unwrap();

        let plan = LoadPlan {
            messages: 20,
            rate_per_sec: 100.0,
            fail_ratio: 1.0,
            redrive: true,
            ..LoadPlan::default()
        };
        let report = run(&bus, &plan).await.unwrap();

        assert!(report.drained);
        assert_eq!(report.metrics.dead_lettered, 20);
        assert_eq!(report.metrics.naked, 20);
        assert_eq!(report.redriven, 20);
        bus.disconnect().await;
    }
}
