//! Consumes a topic over mutual TLS as part of a consumer group, logging every
//! record until interrupted.

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use kafka_mtls_cli::{parse_args, setup_tracing, shutdown_signal, spawn_metrics_server, CommonArgs};
use kafka_mtls_core::{ClientConfig, Consumer, ConsumerRecord, RunError};

/// Mutually authenticated Kafka consumer.
#[derive(Parser)]
#[command(name = "secure-consumer")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Consumer group, overriding the configuration file.
    #[arg(long)]
    group_id: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args: Args = parse_args();
    let mut config = args.common.client_config()?;
    if let Some(group_id) = args.group_id {
        config.consumer.group_id = group_id;
    }
    setup_tracing(&config.logging, args.common.verbose);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        brokers = ?config.kafka.bootstrap_servers,
        topic = %args.common.topic,
        group_id = %config.consumer.group_id,
        "starting secure consumer"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config, args.common.topic))
}

async fn run(config: ClientConfig, topic: String) -> anyhow::Result<()> {
    let mut consumer = Consumer::connect(&config)
        .await
        .context("failed to connect consumer")?;
    spawn_metrics_server(&config.metrics, consumer.metrics());

    if let Err(e) = consumer.subscribe(&topic).await {
        consumer.close().await;
        return Err(e).with_context(|| format!("failed to subscribe to {topic}"));
    }
    info!(topic = %topic, "subscribed");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = consumer
        .run(shutdown_rx, |record| async move {
            log_record(&record);
            Ok::<(), std::convert::Infallible>(())
        })
        .await;

    consumer.close().await;
    info!("consumer closed");

    match result {
        Ok(()) => Ok(()),
        Err(RunError::Client(e)) => Err(e).context("consumer failed"),
        Err(RunError::Handler(never)) => match never {},
    }
}

fn log_record(record: &ConsumerRecord) {
    info!(
        key = record.key_str().unwrap_or("<binary>"),
        value = record.value_str().unwrap_or("<binary>"),
        partition = record.partition,
        offset = record.offset,
        "record received"
    );
}
