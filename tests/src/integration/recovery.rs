//! # Recovery Scenarios
//!
//! Consumer positions live in the transport, keyed by durable name:
//!
//! - A consumer that dies between fetch and ack leaves the message unacked;
//!   a new process with the same durable name gets it again with an
//!   incremented delivery count
//! - A restarted consumer resumes after the last acked message instead of
//!   replaying the stream

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sentinel_bus::{handler_fn, MemoryTransport};

    use crate::harness::{connected_bus, memory_config, wait_until, DeliveryLog, TOPIC};

    #[tokio::test(start_paused = true)]
    async fn test_crash_between_fetch_and_ack_redelivers() {
        let broker = MemoryTransport::new();
        let mut config = memory_config();
        config.shutdown_grace = Duration::from_millis(100);

        // First process: handler hangs, then the process goes away
        let first = connected_bus(config.clone(), &broker).await;
        first
            .subscribe(
                TOPIC,
                "ingest",
                handler_fn(|_delivery, _cancel| async {
                    std::future::pending::<()>().await;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        first.emit(TOPIC, "evidence").await.unwrap();
        let collector = first.metrics_collector();
        wait_until(|| collector.in_flight() == 1).await;
        first.disconnect().await;
        assert_eq!(first.metrics().acked, 0);

        // Second process with the same durable name
        let second = connected_bus(config, &broker).await;
        let log = DeliveryLog::default();
        second
            .subscribe(TOPIC, "ingest", log.acking_handler())
            .await
            .unwrap();

        wait_until(|| second.metrics().acked == 1).await;
        assert_eq!(log.entries(), vec![(1, 2)]);
        second.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_consumer_resumes_position() {
        let broker = MemoryTransport::new();

        let first = connected_bus(memory_config(), &broker).await;
        let before = DeliveryLog::default();
        first
            .subscribe(TOPIC, "indexer", before.acking_handler())
            .await
            .unwrap();
        for i in 0..10 {
            first.emit(TOPIC, format!("{i}")).await.unwrap();
        }
        wait_until(|| first.metrics().acked == 10).await;
        first.disconnect().await;

        // Published while no consumer is running
        let publisher = connected_bus(memory_config(), &broker).await;
        for i in 10..15 {
            publisher.emit(TOPIC, format!("{i}")).await.unwrap();
        }

        let second = connected_bus(memory_config(), &broker).await;
        let after = DeliveryLog::default();
        second
            .subscribe(TOPIC, "indexer", after.acking_handler())
            .await
            .unwrap();
        wait_until(|| second.metrics().acked == 5).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let sequences: Vec<u64> = after.entries().iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, (11..=15).collect::<Vec<u64>>());
        assert!(after.entries().iter().all(|(_, n)| *n == 1));

        publisher.disconnect().await;
        second.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_durable_starts_from_beginning() {
        let broker = MemoryTransport::new();
        let bus = connected_bus(memory_config(), &broker).await;
        for i in 0..3 {
            bus.emit(TOPIC, format!("{i}")).await.unwrap();
        }

        let first = DeliveryLog::default();
        let second = DeliveryLog::default();
        bus.subscribe(TOPIC, "reporting", first.acking_handler()).await.unwrap();
        bus.subscribe(TOPIC, "archive", second.acking_handler()).await.unwrap();

        // Each durable sees the full stream independently
        wait_until(|| bus.metrics().acked == 6).await;
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_same_bus_keeps_unacked() {
        let mut config = memory_config();
        config.shutdown_grace = Duration::from_millis(100);
        let bus = sentinel_bus::Bus::new(config);
        bus.connect().await.unwrap();
        bus.subscribe(
            TOPIC,
            "retry",
            handler_fn(|_delivery, _cancel| async {
                std::future::pending::<()>().await;
                Ok(())
            }),
        )
        .await
        .unwrap();
        bus.emit(TOPIC, "x").await.unwrap();
        let collector = bus.metrics_collector();
        wait_until(|| collector.in_flight() == 1).await;
        bus.disconnect().await;

        bus.connect().await.unwrap();
        let log = DeliveryLog::default();
        bus.subscribe(TOPIC, "retry", log.acking_handler()).await.unwrap();
        wait_until(|| bus.metrics().acked == 1).await;
        assert_eq!(log.entries(), vec![(1, 2)]);
        bus.disconnect().await;
    }
}
