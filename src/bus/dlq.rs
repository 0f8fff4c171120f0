//! Dead-letter routing for unprocessable messages.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusMessage, BusProducer, HEADER_TENANT_ID};
use crate::error::Result;
use crate::metrics;

/// Pipeline stage a message failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Parse,
    Enrich,
    Normalize,
    Write,
    Batch,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Parse => "parse",
            FailureStage::Enrich => "enrich",
            FailureStage::Normalize => "normalize",
            FailureStage::Write => "write",
            FailureStage::Batch => "batch",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqSource {
    Producer,
    Consumer,
}

/// Diagnostic wrapper around the original message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub original_topic: String,
    pub original_key: Option<String>,
    pub original_payload: String,
    pub original_headers: HashMap<String, String>,
    pub error: String,
    pub error_type: String,
    pub stage: FailureStage,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub source: DlqSource,
    pub agent_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl DeadLetterEnvelope {
    /// Wrap a failed broker message. Agent and tenant identity are carried
    /// over best-effort: tenant from the mandatory header, agent from the
    /// payload (falling back to the partitioning key).
    pub fn from_message(
        msg: &BusMessage,
        error: &str,
        error_type: &str,
        stage: FailureStage,
        source: DlqSource,
    ) -> Self {
        let tenant_id = msg.header(HEADER_TENANT_ID).map(str::to_string);
        let agent_id = serde_json::from_slice::<serde_json::Value>(&msg.payload)
            .ok()
            .and_then(|v| v.get("agent_id").and_then(|a| a.as_str()).map(str::to_string))
            .or_else(|| {
                msg.key
                    .as_deref()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
            });

        let now = Utc::now();
        Self {
            original_topic: msg.topic.clone(),
            original_key: msg
                .key
                .as_deref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            original_payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            original_headers: msg.headers.clone(),
            error: error.to_string(),
            error_type: error_type.to_string(),
            stage,
            retry_count: 0,
            first_failed_at: now,
            last_failed_at: now,
            source,
            agent_id,
            tenant_id,
        }
    }
}

/// Routes envelopes to the dead-letter topic. When disabled, envelopes are
/// dropped; the caller still commits the poisoned offset either way.
pub struct DeadLetterRouter {
    producer: Arc<dyn BusProducer>,
    topic: String,
    enabled: bool,
    max_retries: u32,
    backoff_base: Duration,
    cancel: CancellationToken,
}

impl DeadLetterRouter {
    pub fn new(
        producer: Arc<dyn BusProducer>,
        topic: impl Into<String>,
        enabled: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            enabled,
            max_retries: 3,
            backoff_base: Duration::from_millis(200),
            cancel,
        }
    }

    pub async fn route(&self, envelope: &DeadLetterEnvelope) -> Result<()> {
        if !self.enabled {
            tracing::debug!(stage = %envelope.stage, "dead-letter routing disabled, dropping");
            return Ok(());
        }

        let payload = serde_json::to_vec(envelope)?;
        let key = envelope
            .agent_id
            .clone()
            .unwrap_or_else(|| envelope.original_topic.clone());

        self.producer
            .send(&self.topic, key.as_bytes(), &payload, &envelope.original_headers)
            .await?;
        metrics::inc_dlq_routed(envelope.stage.as_str());
        Ok(())
    }

    /// Route with linear backoff (`base × (attempt + 1)`), giving up after
    /// `max_retries` attempts or on cancellation.
    pub async fn route_with_retry(&self, envelope: &mut DeadLetterEnvelope) -> Result<()> {
        let mut last_err = None;

        for attempt in 0..self.max_retries {
            if self.cancel.is_cancelled() {
                return Err(crate::error::CoreError::Cancelled);
            }

            envelope.retry_count = attempt;
            envelope.last_failed_at = Utc::now();
            match self.route(envelope).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "dead-letter produce failed");
                    last_err = Some(e);
                }
            }

            if attempt + 1 < self.max_retries {
                let backoff = self.backoff_base * (attempt + 1);
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = self.cancel.cancelled() => return Err(crate::error::CoreError::Cancelled),
                }
            }
        }

        Err(last_err.unwrap_or_else(|| crate::error::CoreError::internal("dlq retries exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::standard_headers;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingProducer {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        fail_first: Mutex<u32>,
    }

    #[async_trait]
    impl BusProducer for RecordingProducer {
        async fn send(
            &self,
            topic: &str,
            _key: &[u8],
            payload: &[u8],
            _headers: &HashMap<String, String>,
        ) -> Result<()> {
            let mut failures = self.fail_first.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(crate::error::CoreError::internal("broker unavailable"));
            }
            self.sent.lock().push((topic.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn bad_message() -> BusMessage {
        BusMessage {
            topic: "edr.events.raw".into(),
            partition: 2,
            offset: 41,
            key: Some(b"agent-9".to_vec()),
            payload: b"invalid json".to_vec(),
            headers: standard_headers("tenant-a"),
        }
    }

    #[test]
    fn envelope_extracts_identity_best_effort() {
        let envelope = DeadLetterEnvelope::from_message(
            &bad_message(),
            "expected value at line 1",
            "parse_error",
            FailureStage::Parse,
            DlqSource::Consumer,
        );
        assert_eq!(envelope.tenant_id.as_deref(), Some("tenant-a"));
        // Payload is not JSON, so identity falls back to the key.
        assert_eq!(envelope.agent_id.as_deref(), Some("agent-9"));
        assert_eq!(envelope.original_topic, "edr.events.raw");
        assert_eq!(envelope.stage, FailureStage::Parse);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let producer = Arc::new(RecordingProducer {
            sent: Mutex::new(Vec::new()),
            fail_first: Mutex::new(2),
        });
        let router = DeadLetterRouter {
            producer: producer.clone(),
            topic: "edr.dlq".into(),
            enabled: true,
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
            cancel: CancellationToken::new(),
        };

        let mut envelope = DeadLetterEnvelope::from_message(
            &bad_message(),
            "boom",
            "parse_error",
            FailureStage::Parse,
            DlqSource::Consumer,
        );
        router.route_with_retry(&mut envelope).await.unwrap();

        let sent = producer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "edr.dlq");
        assert_eq!(envelope.retry_count, 2);
    }

    #[tokio::test]
    async fn disabled_router_drops_silently() {
        let producer = Arc::new(RecordingProducer {
            sent: Mutex::new(Vec::new()),
            fail_first: Mutex::new(0),
        });
        let router = DeadLetterRouter::new(
            producer.clone(),
            "edr.dlq",
            false,
            CancellationToken::new(),
        );

        let envelope = DeadLetterEnvelope::from_message(
            &bad_message(),
            "boom",
            "parse_error",
            FailureStage::Parse,
            DlqSource::Consumer,
        );
        router.route(&envelope).await.unwrap();
        assert!(producer.sent.lock().is_empty());
    }
}
