//! bus-loadtest: CyberSentinel bus load and replay harness
//!
//! Publishes a bounded-rate stream of messages through the bus, consumes them
//! with competing workers (optionally failing a share of handler calls) and
//! prints the final metrics snapshot as JSON on stdout, or the process-wide
//! Prometheus series with `--prometheus`.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sentinel_bus::{Bus, BusConfig, SubscribeOptions};
use sentinel_telemetry::{encode_metrics, init_telemetry, TelemetryConfig};
use tracing::info;

use bus_loadtest::{run, LoadPlan};

/// CyberSentinel bus load harness
#[derive(Parser, Debug)]
#[command(name = "bus-loadtest")]
#[command(about = "Bounded-rate load and replay runs against the CyberSentinel event bus")]
struct Args {
    /// Transport URL (nats://host:4222 or memory://)
    #[arg(short, long, env = "CS_TRANSPORT_URL", default_value = "memory://")]
    url: String,

    /// Topic to publish on (subject CS.<topic>)
    #[arg(short, long, default_value = "loadtest")]
    topic: String,

    /// Durable consumer name shared by all workers
    #[arg(long, default_value = "loadtest")]
    durable: String,

    /// Messages to publish
    #[arg(short = 'n', long, default_value = "5000")]
    messages: u64,

    /// Publish rate in messages per second (0 = unbounded)
    #[arg(short, long, default_value = "1000")]
    rate: f64,

    /// Payload size in bytes
    #[arg(long, default_value = "256")]
    payload_size: usize,

    /// Share of handler calls that fail, 0.0 to 1.0
    #[arg(long, default_value = "0.0")]
    fail_ratio: f64,

    /// Competing consumer workers
    #[arg(short, long, default_value = "1")]
    consumers: usize,

    /// Override CS_FETCH_BATCH_SIZE for the workers
    #[arg(long)]
    batch_size: Option<u32>,

    /// Override CS_MAX_ACK_PENDING for the workers
    #[arg(long)]
    max_ack_pending: Option<u32>,

    /// Seconds to wait for all messages to settle
    #[arg(long, default_value = "120")]
    drain_timeout: u64,

    /// Re-emit dead letters once the run has drained
    #[arg(long)]
    redrive: bool,

    /// Print the full run report instead of the metrics snapshot
    #[arg(long)]
    report: bool,

    /// Print the Prometheus text exposition instead of JSON
    #[arg(long, conflicts_with = "report")]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _telemetry = init_telemetry(TelemetryConfig::for_component("bus-loadtest"))
        .await
        .context("telemetry init failed")?;

    let mut config = BusConfig::from_env().context("invalid bus configuration")?;
    config.transport_url = args.url.clone();

    let bus = Bus::new(config);
    bus.connect()
        .await
        .with_context(|| format!("cannot connect to {}", args.url))?;

    let plan = LoadPlan {
        topic: args.topic,
        durable: args.durable,
        messages: args.messages,
        rate_per_sec: args.rate,
        payload_size: args.payload_size,
        fail_ratio: args.fail_ratio,
        consumers: args.consumers,
        subscribe: SubscribeOptions {
            fetch_batch_size: args.batch_size,
            max_ack_pending: args.max_ack_pending,
        },
        drain_timeout: Duration::from_secs(args.drain_timeout),
        redrive: args.redrive,
    };
    info!(?plan, "Starting load run");

    let result = run(&bus, &plan).await;
    bus.disconnect().await;
    let report = result?;

    if args.prometheus {
        print!("{}", encode_metrics().context("metrics export failed")?);
    } else if args.report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.metrics.to_json());
    }

    anyhow::ensure!(report.drained, "run did not drain within {}s", plan.drain_timeout.as_secs());
    Ok(())
}
