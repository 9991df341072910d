//! Broker publisher capability
//!
//! High-fanout publishes are handed to the broker as JSON `FanoutEvent`s
//! keyed by author id, so one author's events stay ordered on a partition.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::error::{AppError, Result};
use crate::models::FanoutEvent;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_fanout(&self, event: &FanoutEvent) -> Result<()>;
}

#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    fanout_topic: String,
}

impl KafkaEventPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", "feed-service")
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("retries", "3")
            .set("linger.ms", "5")
            .create::<FutureProducer>()?;

        info!(
            brokers = %config.bootstrap_servers,
            topic = %config.fanout_topic,
            "Fan-out Kafka producer initialized"
        );

        Ok(Self {
            producer,
            fanout_topic: config.fanout_topic.clone(),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish_fanout(&self, event: &FanoutEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let key = event.author_id.to_string();
        let record = FutureRecord::to(&self.fanout_topic)
            .key(&key)
            .payload(&payload);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| AppError::Kafka(e))?;

        debug!(
            video_id = event.video_id,
            author_id = event.author_id,
            "Fan-out event published"
        );
        Ok(())
    }
}
