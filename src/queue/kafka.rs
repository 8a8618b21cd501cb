//! Kafka producer and consumer for the click topic.
//!
//! Events are keyed by `short_code`, so deltas for one code stay
//! partition-affine and arrive in order at a single consumer.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use rdkafka::Message;
use std::time::{Duration, Instant};
use tracing::warn;

use super::{ClickPublisher, ClickSource};
use crate::config::QueueConfig;
use crate::models::ClickEvent;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaClickPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaClickPublisher {
    pub fn new(config: &QueueConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to build kafka producer")?;
        Ok(Self {
            producer,
            topic: config.click_topic.clone(),
        })
    }
}

#[async_trait]
impl ClickPublisher for KafkaClickPublisher {
    async fn publish(&self, event: &ClickEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let record = FutureRecord::to(&self.topic)
            .key(&event.short_code)
            .payload(&payload);

        self.producer
            .send(record, Timeout::After(PUBLISH_TIMEOUT))
            .await
            .map_err(|(err, _)| anyhow!("kafka publish failed: {err}"))?;
        Ok(())
    }
}

pub struct KafkaClickSource {
    consumer: StreamConsumer,
}

impl KafkaClickSource {
    pub fn new(config: &QueueConfig, group: &str, client_id: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", group)
            .set("client.id", client_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .context("failed to build kafka consumer")?;
        consumer
            .subscribe(&[config.click_topic.as_str()])
            .context("failed to subscribe to click topic")?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl ClickSource for KafkaClickSource {
    async fn poll(&self, max: usize, timeout: Duration) -> Result<Vec<ClickEvent>> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();

        while events.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => match message.payload_view::<str>() {
                    Some(Ok(payload)) => match serde_json::from_str::<ClickEvent>(payload) {
                        Ok(event) if !event.short_code.is_empty() && event.delta >= 1 => {
                            events.push(event);
                        }
                        Ok(_) => warn!("dropping click event with empty code or bad delta"),
                        Err(err) => warn!(error = %err, "invalid click payload"),
                    },
                    _ => warn!("click message payload is not utf-8"),
                },
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => break,
            }
        }
        Ok(events)
    }
}
