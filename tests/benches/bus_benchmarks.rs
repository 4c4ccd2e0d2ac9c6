//! # CyberSentinel Bus Benchmarks
//!
//! Hot-path costs that bound delivery throughput:
//!
//! | Path | Called | Target |
//! |------|--------|--------|
//! | `BackoffPolicy::decide` | once per delivery | < 100ns |
//! | `MetricsCollector` record calls | several per delivery | < 1µs |
//! | `MetricsCollector::snapshot` | per report | < 1ms at 2048 samples |
//! | emit → ack over `MemoryTransport` | per message | throughput |

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use sentinel_bus::{handler_fn, BackoffPolicy, Bus, BusConfig, MetricsCollector};

// ============================================================================
// Retry decisions
// ============================================================================

fn bench_backoff_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let policy = BackoffPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));

    group.bench_function("decide_success", |b| {
        b.iter(|| black_box(policy.decide(black_box(true), black_box(3))))
    });

    group.bench_function("decide_failure_ladder", |b| {
        b.iter(|| {
            for n in 1..=5 {
                black_box(policy.decide(false, n));
            }
        })
    });

    group.finish();
}

// ============================================================================
// Metrics hot path
// ============================================================================

fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    let metrics = Arc::new(MetricsCollector::new(2048));

    group.bench_function("record_consume_and_ack", |b| {
        let mut rng = rand::thread_rng();
        b.iter(|| {
            metrics.record_consume(rng.gen_range(0.1..50.0));
            metrics.record_ack();
        })
    });

    group.bench_function("track_in_flight", |b| {
        b.iter(|| black_box(metrics.track_in_flight()))
    });

    for window in [256usize, 2048, 16_384] {
        let collector = MetricsCollector::new(window);
        let mut rng = rand::thread_rng();
        for _ in 0..window {
            collector.record_consume(rng.gen_range(0.1..50.0));
        }
        group.bench_with_input(BenchmarkId::new("snapshot", window), &collector, |b, collector| {
            b.iter(|| black_box(collector.snapshot()))
        });
    }

    group.finish();
}

// ============================================================================
// End-to-end over the in-process broker
// ============================================================================

fn bench_emit_to_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_bus");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    for batch in [100u64, 1_000] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("emit_to_ack", batch), &batch, |b, &batch| {
            b.to_async(&runtime).iter(|| async move {
                let bus = Bus::new(BusConfig::new("memory://"));
                bus.connect().await.expect("connect");
                bus.subscribe("bench", "bench", handler_fn(|_d, _c| async { Ok(()) }))
                    .await
                    .expect("subscribe");

                for i in 0..batch {
                    bus.emit("bench", format!("{i}")).await.expect("emit");
                }
                while bus.metrics().acked < batch {
                    tokio::task::yield_now().await;
                }
                bus.disconnect().await;
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_backoff_decide, bench_metrics, bench_emit_to_ack);
criterion_main!(benches);
