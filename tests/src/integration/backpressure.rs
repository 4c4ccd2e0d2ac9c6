//! # Backpressure and Load Scenarios
//!
//! `max_ack_pending` is enforced by the transport: a consumer that stops
//! settling stops receiving. Under load the in-flight count (`max_lag`) stays
//! within `max_ack_pending + fetch_batch_size`.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use sentinel_bus::{handler_fn, Bus, MemoryTransport, SubscribeOptions};
    use tokio::sync::Semaphore;
    use tokio::time::Instant;

    use crate::harness::{connected_bus, memory_config, wait_until, DeliveryLog, TOPIC};

    #[tokio::test(start_paused = true)]
    async fn test_stalled_consumer_stops_receiving_at_max_ack_pending() {
        let broker = MemoryTransport::new();
        let bus = connected_bus(memory_config(), &broker).await;
        for i in 0..20 {
            bus.emit(TOPIC, format!("{i}")).await.unwrap();
        }

        let gate = Arc::new(Semaphore::new(0));
        let permits = Arc::clone(&gate);
        let handle = bus
            .subscribe_with(
                TOPIC,
                "stalled",
                handler_fn(move |_delivery, _cancel| {
                    let permits = Arc::clone(&permits);
                    async move {
                        permits.acquire().await?.forget();
                        Ok::<(), anyhow::Error>(())
                    }
                }),
                SubscribeOptions {
                    fetch_batch_size: Some(10),
                    max_ack_pending: Some(4),
                },
            )
            .await
            .unwrap();

        let collector = bus.metrics_collector();
        wait_until(|| collector.in_flight() == 4).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let info = broker.consumer_info("CS", &handle.durable).unwrap();
        assert_eq!(info.num_ack_pending, 4);
        assert_eq!(info.num_pending, 16);
        assert_eq!(bus.metrics().max_lag, 4);

        gate.add_permits(1_000);
        wait_until(|| bus.metrics().acked == 20).await;
        assert_eq!(bus.metrics().max_lag, 4);
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_rate_load_drains_within_lag_bound() {
        const MESSAGES: u64 = 5_000;
        let broker = MemoryTransport::new();
        let config = memory_config();
        let lag_bound = u64::from(config.max_ack_pending + config.fetch_batch_size);
        let bus = Arc::new(connected_bus(config, &broker).await);

        for _ in 0..2 {
            bus.subscribe(
                TOPIC,
                "load",
                handler_fn(|_delivery, _cancel| async {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        }

        let producer = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                let started = Instant::now();
                for i in 0..MESSAGES {
                    // 2000 messages per second
                    tokio::time::sleep_until(started + Duration::from_micros(500 * i)).await;
                    bus.emit(TOPIC, format!(r#"{{"seq":{i}}}"#)).await.unwrap();
                }
            })
        };

        let sampler = Arc::clone(&bus);
        wait_until(move || {
            let snapshot = sampler.metrics();
            assert!(snapshot.acked <= snapshot.published);
            assert!(snapshot.max_lag <= lag_bound);
            snapshot.consumed == MESSAGES && snapshot.acked == MESSAGES
        })
        .await;
        producer.await.unwrap();

        let snapshot = bus.metrics();
        assert_eq!(snapshot.published, MESSAGES);
        assert_eq!(snapshot.consumed, MESSAGES);
        assert_eq!(snapshot.naked, 0);
        assert!(snapshot.max_lag <= lag_bound);
        assert!(snapshot.latency_p50_ms <= snapshot.latency_p95_ms);
        assert!(snapshot.latency_p95_ms <= snapshot.latency_p99_ms);
        bus.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_competing_instances_split_backlog_exactly_once() {
        const MESSAGES: u64 = 1_000;
        let broker = MemoryTransport::new();
        let first = Bus::with_memory_transport(memory_config(), &broker);
        let second = Bus::with_memory_transport(memory_config(), &broker);
        first.connect().await.unwrap();
        second.connect().await.unwrap();
        for i in 0..MESSAGES {
            first.emit(TOPIC, format!("{i}")).await.unwrap();
        }

        // Two workers per instance, all under one durable name
        let logs: Vec<DeliveryLog> = (0..4).map(|_| DeliveryLog::default()).collect();
        for (index, log) in logs.iter().enumerate() {
            let bus = if index % 2 == 0 { &first } else { &second };
            let log = log.clone();
            bus.subscribe(
                TOPIC,
                "workers",
                handler_fn(move |delivery, _cancel| {
                    log.record(&delivery);
                    async {
                        tokio::task::yield_now().await;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        }

        wait_until(|| first.metrics().acked + second.metrics().acked == MESSAGES).await;

        let mut counts: HashMap<u64, usize> = HashMap::new();
        for log in &logs {
            for (sequence, times) in log.counts() {
                *counts.entry(sequence).or_insert(0) += times;
            }
        }
        assert_eq!(counts.len(), MESSAGES as usize);
        assert!(counts.values().all(|times| *times == 1));
        assert_eq!(first.metrics().redeliveries + second.metrics().redeliveries, 0);

        first.disconnect().await;
        second.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_snapshot_json_shape() {
        let broker = MemoryTransport::new();
        let bus = connected_bus(memory_config(), &broker).await;
        let log = DeliveryLog::default();
        bus.subscribe(TOPIC, "json", log.acking_handler()).await.unwrap();
        bus.emit(TOPIC, "x").await.unwrap();
        wait_until(|| bus.metrics().acked == 1).await;

        let json = bus.metrics().to_json();
        for field in [
            "published",
            "consumed",
            "acked",
            "naked",
            "dead_lettered",
            "redeliveries",
            "latency_p50_ms",
            "latency_p95_ms",
            "latency_p99_ms",
            "max_lag",
        ] {
            assert!(json.contains(&format!("\"{field}\"")), "missing {field} in {json}");
        }
        bus.disconnect().await;
    }
}
