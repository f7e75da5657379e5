use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use common_kafka::kafka_consumer::SingleTopicConsumer;
use metrics_exporter_prometheus::PrometheusBuilder;
use spine::{DecodedRecord, Input, LifecycleGuard, Spine};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::Config;

mod config;

fn setup_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("invalid metrics bind address {bind_address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install metrics exporter")?;
    info!("Metrics server listening on {}", addr);
    Ok(())
}

async fn log_record(input: Input<()>) -> Result<Option<DecodedRecord>> {
    let Some(record) = input.raw() else {
        return Ok(None);
    };
    info!(key = record.key.as_str(), value = record.value.as_str(), "received message");
    Ok(Some(record))
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();

    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    if config.export_prometheus {
        setup_metrics(&config.metrics_bind_address)?;
    }

    let consumer = SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())
        .context("Failed to create kafka consumer")?;
    info!(topic = consumer.topic(), "subscribed");

    let guard = LifecycleGuard::new(Arc::new(consumer.clone()));
    let pipeline = Spine::new(consumer.clone(), consumer, config.pipeline.clone())?
        .pipeline()
        .transform(log_record)
        .sink();

    let exit_code = tokio::select! {
        result = pipeline.run() => match result {
            Ok(summary) => {
                info!(acknowledged = summary.acknowledged, "source ended, shutting down");
                guard.close().await?;
                0
            }
            Err(e) => {
                error!(kind = e.kind(), "fatal pipeline error: {:#}", e);
                if let Err(close_err) = guard.close().await {
                    error!("failed to disconnect after pipeline error: {:#}", close_err);
                }
                1
            }
        },
        reason = guard.wait_for_shutdown() => {
            let reason = reason?;
            info!(exit_code = reason.exit_code(), "shutdown complete");
            reason.exit_code()
        }
    };

    std::process::exit(exit_code)
}
