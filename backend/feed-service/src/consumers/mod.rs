//! Broker listeners
//!
//! Both topics share one receive loop: read, hand the payload to its handler,
//! commit. Malformed payloads are logged and committed so a poison message
//! never blocks the partition. Read errors back off for one second.

pub mod fanout_consumer;
pub mod like_consumer;

pub use fanout_consumer::FanoutEventHandler;
pub use like_consumer::LikeEventHandler;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{AppError, Result};

#[async_trait]
pub trait PayloadHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle one message body. `AppError::Serialization` marks a payload
    /// that will never parse.
    async fn handle(&self, payload: &[u8]) -> Result<()>;
}

fn build_consumer(config: &KafkaConfig, topic: &str) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "latest")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "45000")
        .set("max.poll.interval.ms", "300000")
        .create()?;

    consumer.subscribe(&[topic])?;
    Ok(consumer)
}

/// Consume `topic` until the shutdown signal flips. A message being handled
/// when shutdown arrives is finished and committed first.
pub async fn run_listener<H: PayloadHandler>(
    config: KafkaConfig,
    topic: String,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) {
    let consumer = match build_consumer(&config, &topic) {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(topic = %topic, error = %e, "Failed to start Kafka listener");
            return;
        }
    };

    info!(
        topic = %topic,
        group = %config.group_id,
        handler = handler.name(),
        "Kafka listener started"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = consumer.recv() => match received {
                Ok(record) => {
                    match record.payload() {
                        Some(payload) => log_outcome(&handler, handler.handle(payload).await),
                        None => debug!(topic = %topic, "Skipping Kafka message with empty payload"),
                    }

                    if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                        warn!(topic = %topic, error = %e, "Failed to commit Kafka offset");
                    }
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "Kafka receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    info!(topic = %topic, "Kafka listener stopped");
}

fn log_outcome<H: PayloadHandler>(handler: &H, outcome: Result<()>) {
    match outcome {
        Ok(()) => {}
        Err(AppError::Serialization(e)) => {
            warn!(handler = handler.name(), error = %e, "Dropping malformed message")
        }
        Err(e) => error!(handler = handler.name(), error = %e, "Message handling failed"),
    }
}
