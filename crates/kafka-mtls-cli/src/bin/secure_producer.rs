//! Sends a numbered series of records over mutual TLS and reports where the
//! broker stored each one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use kafka_mtls_cli::{parse_args, setup_tracing, shutdown_signal, spawn_metrics_server, CommonArgs};
use kafka_mtls_core::{ClientConfig, Producer, ProducerRecord};

/// Mutually authenticated Kafka producer.
#[derive(Parser)]
#[command(name = "secure-producer")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of records to send.
    #[arg(long, default_value_t = 10)]
    count: u64,

    /// Pause between records, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    interval_ms: u64,
}

fn main() -> anyhow::Result<()> {
    let args: Args = parse_args();
    let config = args.common.client_config()?;
    setup_tracing(&config.logging, args.common.verbose);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        brokers = ?config.kafka.bootstrap_servers,
        topic = %args.common.topic,
        "starting secure producer"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(
        config,
        args.common.topic,
        args.count,
        Duration::from_millis(args.interval_ms),
    ))
}

async fn run(config: ClientConfig, topic: String, count: u64, interval: Duration) -> anyhow::Result<()> {
    let producer = Producer::connect(&config)
        .await
        .context("failed to connect producer")?;
    spawn_metrics_server(&config.metrics, producer.metrics());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let result = async {
        for i in 0..count {
            let key = format!("key-{i}");
            let value = format!("message-{}-{i}", now_millis());
            let ack = producer
                .send(ProducerRecord::text(&topic, &key, &value))
                .await?
                .await
                .with_context(|| format!("failed to deliver {key}"))?;
            info!(
                key = %key,
                partition = ack.partition,
                offset = ack.offset,
                "record sent"
            );

            if i + 1 < count {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = &mut shutdown => {
                        warn!(sent = i + 1, "stopping early");
                        break;
                    }
                }
            }
        }
        producer.flush().await?;
        anyhow::Ok(())
    }
    .await;

    producer.close().await;
    info!("producer closed");
    result
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}
