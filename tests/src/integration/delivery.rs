//! # Delivery Scenarios
//!
//! Retry ladder and dead-lettering driven through the public `Bus` surface:
//!
//! 1. A permanently failing handler is naked with 1s, 2s, 4s, 8s and the fifth
//!    failure dead-letters the message
//! 2. A handler that recovers on a later attempt ends acked, never dead-lettered
//! 3. One consumer instance handles and settles messages in fetch order

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use sentinel_bus::message::{HEADER_ERROR, HEADER_NUM_DELIVERED, HEADER_ORIGINAL_SUBJECT};
    use sentinel_bus::{handler_fn, DeadLetterRecord, MemoryTransport};

    use crate::harness::{connected_bus, memory_config, wait_until, DeliveryLog, TOPIC};

    // =============================================================================
    // RETRY LADDER
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_failing_handler_walks_ladder_then_dead_letters() {
        let broker = MemoryTransport::new();
        let bus = connected_bus(memory_config(), &broker).await;
        let log = DeliveryLog::default();
        let handle = bus
            .subscribe(TOPIC, "triage", log.failing_handler("parser rejected payload"))
            .await
            .unwrap();

        bus.emit(TOPIC, r#"{"alert":"port-scan"}"#).await.unwrap();
        wait_until(|| bus.metrics().dead_lettered == 1).await;

        let snapshot = bus.metrics();
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.consumed, 5);
        assert_eq!(snapshot.naked, 4);
        assert_eq!(snapshot.redeliveries, 4);
        assert_eq!(snapshot.acked, 0);

        // Delivery counts 1..=5, one per attempt
        let attempts: Vec<u32> = log.entries().iter().map(|(_, n)| *n).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4, 5]);

        let info = broker.consumer_info("CS", &handle.durable).unwrap();
        let ladder: Vec<u64> = info.nak_delays.iter().map(Duration::as_secs).collect();
        assert_eq!(ladder, vec![1, 2, 4, 8]);

        // Original is settled and never redelivered
        wait_until(|| broker.consumer_info("CS", &handle.durable).unwrap().num_ack_pending == 0).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(log.len(), 5);

        let dlq = broker.stream_messages("CS_DLQ");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].subject, "CS_DLQ.alerts");
        assert_eq!(dlq[0].headers[HEADER_ORIGINAL_SUBJECT], "CS.alerts");
        assert_eq!(dlq[0].headers[HEADER_NUM_DELIVERED], "5");
        assert_eq!(dlq[0].headers[HEADER_ERROR], "parser rejected payload");

        let record = DeadLetterRecord::from_message(&dlq[0]).unwrap();
        assert_eq!(record.original_message.payload, r#"{"alert":"port-scan"}"#.as_bytes());
        assert_eq!(record.num_delivered, 5);
        assert_eq!(record.consumer, handle.durable);

        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ladder_respects_max_delay() {
        let mut config = memory_config();
        config.max_deliver = 8;
        config.retry_max_delay = Duration::from_secs(10);
        let broker = MemoryTransport::new();
        let bus = connected_bus(config, &broker).await;
        let log = DeliveryLog::default();
        let handle = bus
            .subscribe(TOPIC, "capped", log.failing_handler("boom"))
            .await
            .unwrap();

        bus.emit(TOPIC, "x").await.unwrap();
        wait_until(|| bus.metrics().dead_lettered == 1).await;

        let info = broker.consumer_info("CS", &handle.durable).unwrap();
        let ladder: Vec<u64> = info.nak_delays.iter().map(Duration::as_secs).collect();
        assert_eq!(ladder, vec![1, 2, 4, 8, 10, 10, 10]);
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovering_handler_is_acked() {
        let broker = MemoryTransport::new();
        let bus = connected_bus(memory_config(), &broker).await;
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        bus.subscribe(
            TOPIC,
            "flaky",
            handler_fn(move |_delivery, _cancel| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        anyhow::bail!("enrichment service unavailable");
                    }
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

        bus.emit(TOPIC, "x").await.unwrap();
        wait_until(|| bus.metrics().acked == 1).await;

        let snapshot = bus.metrics();
        assert_eq!(snapshot.naked, 2);
        assert_eq!(snapshot.dead_lettered, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(broker.stream_messages("CS_DLQ").is_empty());
        bus.disconnect().await;
    }

    // =============================================================================
    // ORDERING
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_single_consumer_handles_in_fetch_order() {
        let broker = MemoryTransport::new();
        let bus = connected_bus(memory_config(), &broker).await;
        for i in 0..50 {
            bus.emit(TOPIC, format!("{i}")).await.unwrap();
        }

        let log = DeliveryLog::default();
        bus.subscribe(TOPIC, "ordered", log.acking_handler())
            .await
            .unwrap();
        wait_until(|| bus.metrics().acked == 50).await;

        let sequences: Vec<u64> = log.entries().iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, (1..=50).collect::<Vec<u64>>());
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_topics_are_isolated() {
        let broker = MemoryTransport::new();
        let bus = connected_bus(memory_config(), &broker).await;
        let alerts = DeliveryLog::default();
        let audit = DeliveryLog::default();
        bus.subscribe("alerts", "a", alerts.acking_handler()).await.unwrap();
        bus.subscribe("audit", "b", audit.acking_handler()).await.unwrap();

        bus.emit("alerts", "1").await.unwrap();
        bus.emit("audit", "2").await.unwrap();
        bus.emit("alerts", "3").await.unwrap();
        wait_until(|| bus.metrics().acked == 3).await;

        assert_eq!(alerts.len(), 2);
        assert_eq!(audit.len(), 1);
        bus.disconnect().await;
    }
}
