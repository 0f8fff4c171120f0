//! Kafka producer with per-key ordering and bounded retry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::bus::BusProducer;
use crate::config::KafkaConfig;
use crate::error::{CoreError, Result};

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u32 = 3;

pub struct KafkaEventProducer {
    inner: FutureProducer,
    cancel: CancellationToken,
}

impl KafkaEventProducer {
    pub fn new(cfg: &KafkaConfig, cancel: CancellationToken) -> Result<Self> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &cfg.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "5000")
            .set("socket.connection.setup.timeout.ms", (cfg.dial_timeout_secs * 1000).to_string())
            // Hash partitioner keeps one agent on one partition.
            .set("partitioner", "murmur2_random")
            .create()
            .map_err(|e| CoreError::config(format!("failed to create producer: {e}")))?;

        Ok(Self { inner, cancel })
    }

    async fn send_with_retry(
        &self,
        topic: &str,
        key: &[u8],
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        let mut backoff = RETRY_BASE;
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let mut owned = OwnedHeaders::new();
            for (name, value) in headers {
                owned = owned.insert(Header { key: name, value: Some(value.as_bytes()) });
            }
            let record = FutureRecord::to(topic)
                .key(key)
                .payload(payload)
                .headers(owned);

            match self.inner.send(record, Duration::from_secs(5)).await {
                Ok(_) => return Ok(()),
                Err((e, _)) => {
                    let err: CoreError = e.into();
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    tracing::warn!(topic, attempt, error = %err, "produce failed, backing off");
                    last_err = Some(err);
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                }
                backoff = (backoff * 2).min(RETRY_CAP);
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::internal("produce retries exhausted")))
    }
}

#[async_trait]
impl BusProducer for KafkaEventProducer {
    async fn send(
        &self,
        topic: &str,
        key: &[u8],
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        self.send_with_retry(topic, key, payload, headers).await
    }
}
