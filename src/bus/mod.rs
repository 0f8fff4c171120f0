//! Broker client: ordered produce, offset-controlled consume, topic
//! management and the dead-letter router.
//!
//! The pipeline talks to the broker through the [`BusProducer`] and
//! [`MessageSource`] seams so the processing chain can be exercised against
//! in-memory fakes.

pub mod consumer;
pub mod dlq;
pub mod producer;
pub mod topics;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Header names every message on the incoming topic carries.
pub const HEADER_TENANT_ID: &str = "tenant_id";
pub const HEADER_SCHEMA_VERSION: &str = "schema_version";
pub const HEADER_CONTENT_TYPE: &str = "content_type";
pub const HEADER_TRACE_ID: &str = "trace_id";
pub const HEADER_SOURCE_SERVICE: &str = "source_service";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// One raw message plus the broker coordinates needed to commit it.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl BusMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Produce side of the broker. Implementations must preserve per-key
/// ordering (hash partitioning on the key).
#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn send(
        &self,
        topic: &str,
        key: &[u8],
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<()>;

    /// Produce a batch of raw events sharing one partitioning key (their
    /// agent id), in order, with the standard header set. Returns once the
    /// broker has acknowledged every message.
    async fn produce_batch(
        &self,
        topic: &str,
        agent_id: &str,
        tenant_id: &str,
        events: &[crate::models::RawEvent],
    ) -> Result<()> {
        let headers = standard_headers(tenant_id);
        for event in events {
            let payload = serde_json::to_vec(event)?;
            self.send(topic, agent_id.as_bytes(), &payload, &headers).await?;
        }
        Ok(())
    }
}

/// Consume side of the broker with explicit offset control.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Blocking fetch bounded by `max_wait`; `None` when nothing arrived.
    async fn fetch(&self, max_wait: Duration) -> Result<Option<BusMessage>>;

    /// Commit `(partition, offset + 1)` for each supplied message. An empty
    /// slice is a no-op.
    async fn commit(&self, messages: &[BusMessage]) -> Result<()>;
}

/// Standard header set for payloads written to the raw and normalized
/// topics.
pub fn standard_headers(tenant_id: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(HEADER_TENANT_ID.to_string(), tenant_id.to_string());
    headers.insert(
        HEADER_SCHEMA_VERSION.to_string(),
        crate::models::SCHEMA_VERSION.to_string(),
    );
    headers.insert(HEADER_CONTENT_TYPE.to_string(), CONTENT_TYPE_JSON.to_string());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_raw;
    use parking_lot::Mutex;

    #[test]
    fn standard_headers_carry_schema_version() {
        let headers = standard_headers("tenant-a");
        assert_eq!(headers.get(HEADER_TENANT_ID).unwrap(), "tenant-a");
        assert_eq!(headers.get(HEADER_SCHEMA_VERSION).unwrap(), "v1");
        assert_eq!(headers.get(HEADER_CONTENT_TYPE).unwrap(), CONTENT_TYPE_JSON);
    }

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(Vec<u8>, Vec<u8>, HashMap<String, String>)>>,
    }

    #[async_trait]
    impl BusProducer for Recording {
        async fn send(
            &self,
            _topic: &str,
            key: &[u8],
            payload: &[u8],
            headers: &HashMap<String, String>,
        ) -> Result<()> {
            self.sent
                .lock()
                .push((key.to_vec(), payload.to_vec(), headers.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn produce_batch_keys_every_message_by_agent() {
        let producer = Recording::default();
        let events: Vec<_> = (0..3)
            .map(|i| {
                let body = serde_json::json!({
                    "event_id": format!("evt-{i}"),
                    "agent_id": "agent-1",
                    "tenant_id": "tenant-a",
                    "timestamp_ns": i,
                    "kind": "dns_query",
                    "dns": {"query_name": "example.com"}
                })
                .to_string();
                parse_raw(body.as_bytes()).unwrap()
            })
            .collect();

        producer
            .produce_batch("edr.events.raw", "agent-1", "tenant-a", &events)
            .await
            .unwrap();

        let sent = producer.sent.lock();
        assert_eq!(sent.len(), 3);
        for (i, (key, payload, headers)) in sent.iter().enumerate() {
            assert_eq!(key.as_slice(), b"agent-1");
            assert_eq!(headers.get(HEADER_SCHEMA_VERSION).unwrap(), "v1");
            let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
            assert_eq!(value["event_id"], format!("evt-{i}"));
        }
    }
}
