//! Kafka consumer with explicit offset commits.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};

use crate::bus::{BusMessage, MessageSource};
use crate::config::KafkaConfig;
use crate::error::{CoreError, Result};

struct LoggingContext;

impl ClientContext for LoggingContext {}

impl ConsumerContext for LoggingContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        tracing::info!(?rebalance, "pre-rebalance");
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        tracing::info!(?rebalance, "post-rebalance");
    }
}

type LoggingConsumer = StreamConsumer<LoggingContext>;

pub struct KafkaEventSource {
    consumer: LoggingConsumer,
}

impl KafkaEventSource {
    pub fn new(cfg: &KafkaConfig) -> Result<Self> {
        let consumer: LoggingConsumer = ClientConfig::new()
            .set("group.id", &cfg.group_id)
            .set("bootstrap.servers", &cfg.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("max.poll.interval.ms", "300000")
            .set("socket.connection.setup.timeout.ms", (cfg.dial_timeout_secs * 1000).to_string())
            .create_with_context(LoggingContext)
            .map_err(|e| CoreError::config(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[cfg.raw_topic.as_str()])
            .map_err(|e| CoreError::config(format!("failed to subscribe: {e}")))?;

        tracing::info!(
            brokers = %cfg.brokers,
            topic = %cfg.raw_topic,
            group = %cfg.group_id,
            "consumer initialized"
        );

        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for KafkaEventSource {
    async fn fetch(&self, max_wait: Duration) -> Result<Option<BusMessage>> {
        match tokio::time::timeout(max_wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(msg)) => {
                let mut headers = HashMap::new();
                if let Some(borrowed) = msg.headers() {
                    for header in borrowed.iter() {
                        if let Some(value) = header.value {
                            headers.insert(
                                header.key.to_string(),
                                String::from_utf8_lossy(value).into_owned(),
                            );
                        }
                    }
                }
                Ok(Some(BusMessage {
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    key: msg.key().map(|k| k.to_vec()),
                    payload: msg.payload().unwrap_or_default().to_vec(),
                    headers,
                }))
            }
        }
    }

    async fn commit(&self, messages: &[BusMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        // One commit per (topic, partition), at the highest offset + 1.
        let mut highest: HashMap<(String, i32), i64> = HashMap::new();
        for msg in messages {
            let entry = highest
                .entry((msg.topic.clone(), msg.partition))
                .or_insert(msg.offset);
            *entry = (*entry).max(msg.offset);
        }

        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in highest {
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
                .map_err(|e| CoreError::internal(format!("failed to stage offset: {e}")))?;
        }

        self.consumer.commit(&tpl, CommitMode::Sync)?;
        crate::metrics::inc_commits();
        Ok(())
    }
}
