//! # Dead-Letter Scenarios
//!
//! - A failing dead-letter write leaves the original unacked (default policy)
//!   and the transport stops redelivering it once `max_deliver` is spent
//! - Dead-letter writes are idempotent per exhausted delivery
//! - Redrive re-emits dead letters to their original subject

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use sentinel_bus::message::{HEADER_CONSUMER, HEADER_MSG_ID, HEADER_ORIGINAL_SEQUENCE};
    use sentinel_bus::{handler_fn, DeadLetterRecord, DlqFailurePolicy, MemoryTransport};

    use crate::harness::{connected_bus, memory_config, wait_until, DeliveryLog, TOPIC};

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_write_failure_withholds_ack() {
        let mut config = memory_config();
        config.max_deliver = 3;
        let broker = MemoryTransport::new();
        let bus = connected_bus(config, &broker).await;
        broker.fail_publishes_matching("CS_DLQ.", 10_000);

        let log = DeliveryLog::default();
        let handle = bus
            .subscribe(TOPIC, "withhold", log.failing_handler("boom"))
            .await
            .unwrap();
        bus.emit(TOPIC, "x").await.unwrap();

        let collector = bus.metrics_collector();
        wait_until(|| collector.dead_letter_write_failures() == 1).await;
        let snapshot = bus.metrics();
        assert_eq!(snapshot.dead_lettered, 0);
        assert_eq!(snapshot.acked, 0);
        assert!(broker.stream_messages("CS_DLQ").is_empty());

        // The transport gives up after max_deliver; the message stays in the stream
        tokio::time::sleep(Duration::from_secs(120)).await;
        let info = broker.consumer_info("CS", &handle.durable).unwrap();
        assert_eq!(info.num_acked, 0);
        assert_eq!(info.num_exhausted, 1);
        assert_eq!(log.len(), 3);
        assert_eq!(broker.stream_messages("CS").len(), 1);
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_and_log_policy_settles_original() {
        let mut config = memory_config();
        config.max_deliver = 1;
        config.dlq_failure_policy = DlqFailurePolicy::AckAndLog;
        let broker = MemoryTransport::new();
        let bus = connected_bus(config, &broker).await;
        broker.fail_publishes_matching("CS_DLQ.", 10_000);

        let log = DeliveryLog::default();
        let handle = bus
            .subscribe(TOPIC, "ack-and-log", log.failing_handler("boom"))
            .await
            .unwrap();
        bus.emit(TOPIC, "x").await.unwrap();

        wait_until(|| {
            broker
                .consumer_info("CS", &handle.durable)
                .map_or(false, |info| info.num_acked == 1)
        })
        .await;
        assert_eq!(bus.metrics().dead_lettered, 0);
        assert_eq!(bus.metrics_collector().dead_letter_write_failures(), 1);
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_dead_letter_failure_is_retried() {
        let mut config = memory_config();
        config.max_deliver = 1;
        let broker = MemoryTransport::new();
        let bus = connected_bus(config, &broker).await;
        broker.fail_publishes_matching("CS_DLQ.", 2);

        let log = DeliveryLog::default();
        bus.subscribe(TOPIC, "retry-dlq", log.failing_handler("boom"))
            .await
            .unwrap();
        bus.emit(TOPIC, "x").await.unwrap();

        wait_until(|| bus.metrics().dead_lettered == 1).await;
        assert_eq!(broker.stream_messages("CS_DLQ").len(), 1);
        assert_eq!(bus.metrics_collector().dead_letter_write_failures(), 0);
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_record_carries_diagnostics() {
        let mut config = memory_config();
        config.max_deliver = 2;
        config.dlq_error_max_len = 16;
        let broker = MemoryTransport::new();
        let bus = connected_bus(config, &broker).await;

        let handle = bus
            .subscribe(
                TOPIC,
                "diagnostics",
                handler_fn(|_delivery, _cancel| async {
                    Err(anyhow::anyhow!("x".repeat(100)))
                }),
            )
            .await
            .unwrap();
        let sequence = bus.emit(TOPIC, "payload").await.unwrap();
        wait_until(|| bus.metrics().dead_lettered == 1).await;

        let dlq = broker.stream_messages("CS_DLQ");
        assert_eq!(dlq.len(), 1);
        let headers = &dlq[0].headers;
        assert_eq!(headers[HEADER_ORIGINAL_SEQUENCE], sequence.to_string());
        assert_eq!(headers[HEADER_CONSUMER], handle.durable);
        assert_eq!(headers[HEADER_MSG_ID], format!("dlq:CS.alerts:{sequence}"));

        let record = DeadLetterRecord::from_message(&dlq[0]).unwrap();
        assert_eq!(record.error_summary.len(), 16);
        assert_eq!(record.num_delivered, 2);
        assert_eq!(record.original_message.subject, "CS.alerts");
        assert_eq!(record.original_message.sequence, sequence);
        bus.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_instances_dead_letter_once() {
        let mut config = memory_config();
        config.max_deliver = 1;
        let broker = MemoryTransport::new();
        let first = connected_bus(config.clone(), &broker).await;
        let second = connected_bus(config, &broker).await;

        let log = DeliveryLog::default();
        first.subscribe(TOPIC, "shared", log.failing_handler("boom")).await.unwrap();
        second.subscribe(TOPIC, "shared", log.failing_handler("boom")).await.unwrap();
        for i in 0..10 {
            first.emit(TOPIC, format!("{i}")).await.unwrap();
        }

        wait_until(|| first.metrics().dead_lettered + second.metrics().dead_lettered == 10).await;
        assert_eq!(broker.stream_messages("CS_DLQ").len(), 10);
        first.disconnect().await;
        second.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_redrive_after_fix() {
        let mut config = memory_config();
        config.max_deliver = 2;
        let broker = MemoryTransport::new();
        let bus = connected_bus(config, &broker).await;

        let fixed = Arc::new(AtomicBool::new(false));
        let log = DeliveryLog::default();
        {
            let fixed = Arc::clone(&fixed);
            let log = log.clone();
            bus.subscribe(
                TOPIC,
                "redrive",
                handler_fn(move |delivery, _cancel| {
                    log.record(&delivery);
                    let fixed = fixed.load(Ordering::SeqCst);
                    async move {
                        if fixed {
                            Ok(())
                        } else {
                            Err(anyhow::anyhow!("schema mismatch"))
                        }
                    }
                }),
            )
            .await
            .unwrap();
        }

        for i in 0..3 {
            bus.emit(TOPIC, format!("{i}")).await.unwrap();
        }
        wait_until(|| bus.metrics().dead_lettered == 3).await;

        fixed.store(true, Ordering::SeqCst);
        assert_eq!(bus.redrive_dead_letters(TOPIC, 10).await.unwrap(), 3);
        wait_until(|| bus.metrics().acked == 3).await;

        let snapshot = bus.metrics();
        assert_eq!(snapshot.published, 6);
        assert_eq!(snapshot.dead_lettered, 3);

        // Redriven copies are new messages, delivered fresh
        let redriven: Vec<(u64, u32)> = log.entries().into_iter().filter(|(s, _)| *s > 3).collect();
        assert_eq!(redriven.len(), 3);
        assert!(redriven.iter().all(|(_, n)| *n == 1));

        assert_eq!(bus.redrive_dead_letters(TOPIC, 10).await.unwrap(), 0);
        bus.disconnect().await;
    }
}
