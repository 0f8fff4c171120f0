//! End-to-end pipeline behavior over in-memory bus fakes: decode failures
//! go to the DLQ and are committed, good events reach every sink with
//! per-agent order intact.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use edr_core::bus::dlq::{DeadLetterEnvelope, DeadLetterRouter};
use edr_core::bus::{standard_headers, BusMessage, BusProducer, MessageSource};
use edr_core::error::Result;
use edr_core::pipeline::{
    EnricherChain, Normalizer, PipelineCoordinator, PipelineOptions, PipelineState, SinkRecord,
    SinkSet,
};
use edr_core::pipeline::sink::EventSink;

struct InMemorySource {
    queue: Mutex<VecDeque<BusMessage>>,
    committed: Mutex<Vec<i64>>,
}

impl InMemorySource {
    fn new(messages: Vec<BusMessage>) -> Self {
        Self {
            queue: Mutex::new(messages.into()),
            committed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn fetch(&self, max_wait: Duration) -> Result<Option<BusMessage>> {
        let next = self.queue.lock().pop_front();
        if next.is_none() {
            tokio::time::sleep(max_wait).await;
        }
        Ok(next)
    }

    async fn commit(&self, messages: &[BusMessage]) -> Result<()> {
        let mut committed = self.committed.lock();
        for message in messages {
            committed.push(message.offset);
        }
        Ok(())
    }
}

#[derive(Default)]
struct CapturingProducer {
    by_topic: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

#[async_trait]
impl BusProducer for CapturingProducer {
    async fn send(
        &self,
        topic: &str,
        _key: &[u8],
        payload: &[u8],
        _headers: &HashMap<String, String>,
    ) -> Result<()> {
        self.by_topic
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(payload.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<SinkRecord>>,
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, record: &SinkRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

fn raw_message(offset: i64, event_id: &str, kind: &str) -> BusMessage {
    let payload = serde_json::json!({
        "event_id": event_id,
        "agent_id": "agent-1",
        "tenant_id": "11111111-2222-3333-4444-555555555555",
        "timestamp_ns": 1_700_000_000_000_000_000i64 + offset,
        "kind": kind,
        "process": {"pid": 100 + offset, "name": "proc"},
        "dns": {"query_name": "example.com"}
    })
    .to_string();
    BusMessage {
        topic: "edr.events.raw".into(),
        partition: 0,
        offset,
        key: Some(b"agent-1".to_vec()),
        payload: payload.into_bytes(),
        headers: standard_headers("11111111-2222-3333-4444-555555555555"),
    }
}

fn bad_message(offset: i64) -> BusMessage {
    BusMessage {
        topic: "edr.events.raw".into(),
        partition: 0,
        offset,
        key: Some(b"agent-1".to_vec()),
        payload: b"invalid json".to_vec(),
        headers: standard_headers("11111111-2222-3333-4444-555555555555"),
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        consume_workers: 1,
        batch_workers: 1,
        batch_size: 3,
        batch_timeout: Duration::from_millis(20),
        fetch_max_wait: Duration::from_millis(10),
        message_buffer: 64,
        error_buffer: 16,
        shutdown_timeout: Duration::from_secs(2),
        sink_max_retries: 2,
    }
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn events_flow_to_sinks_and_failures_go_to_dlq() {
    let mut messages: Vec<BusMessage> = (0..5)
        .map(|i| raw_message(i, &format!("evt-{i}"), "process_create"))
        .collect();
    messages.push(bad_message(5));
    messages.push(raw_message(6, "evt-6", "registry_write")); // unsupported kind

    let source = Arc::new(InMemorySource::new(messages));
    let dlq_producer = Arc::new(CapturingProducer::default());
    let sink = Arc::new(MemorySink::default());
    let cancel = CancellationToken::new();

    let coordinator = PipelineCoordinator::new(
        source.clone(),
        EnricherChain::new(vec![]),
        Normalizer::new(),
        SinkSet::new(vec![sink.clone()]),
        DeadLetterRouter::new(dlq_producer.clone(), "edr.dlq", true, cancel.clone()),
        options(),
        cancel,
    );
    coordinator.start();
    assert_eq!(coordinator.state(), PipelineState::Running);

    let done = wait_until(Duration::from_secs(5), || {
        sink.records.lock().len() == 5
            && dlq_producer
                .by_topic
                .lock()
                .get("edr.dlq")
                .map(|v| v.len())
                .unwrap_or(0)
                == 2
    })
    .await;
    assert!(done, "pipeline did not drain in time");

    coordinator.stop().await;
    assert_eq!(coordinator.state(), PipelineState::Stopped);

    // Good events: ids preserved, per-agent order intact.
    let records = sink.records.lock();
    let ids: Vec<&str> = records.iter().map(|r| r.event.event.id.as_str()).collect();
    assert_eq!(ids, vec!["evt-0", "evt-1", "evt-2", "evt-3", "evt-4"]);
    for record in records.iter() {
        assert_eq!(record.agent_id, "agent-1");
        assert_eq!(record.event.schema_version, "v1");
    }

    // DLQ envelopes carry stage and identity.
    let by_topic = dlq_producer.by_topic.lock();
    let envelopes: Vec<DeadLetterEnvelope> = by_topic["edr.dlq"]
        .iter()
        .map(|payload| serde_json::from_slice(payload).unwrap())
        .collect();
    let stages: Vec<&str> = envelopes.iter().map(|e| e.stage.as_str()).collect();
    assert!(stages.contains(&"parse"));
    assert!(stages.contains(&"normalize"));
    for envelope in &envelopes {
        assert_eq!(envelope.original_topic, "edr.events.raw");
        assert_eq!(
            envelope.tenant_id.as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }

    // Every consumed offset was committed, including the poisoned ones.
    let mut committed = source.committed.lock().clone();
    committed.sort_unstable();
    assert_eq!(committed, vec![0, 1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn sink_failures_exhaust_retries_then_dead_letter() {
    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn write(&self, _record: &SinkRecord) -> Result<()> {
            Err(edr_core::error::CoreError::sink("index unavailable"))
        }
    }

    let source = Arc::new(InMemorySource::new(vec![raw_message(0, "evt-0", "dns_query")]));
    let dlq_producer = Arc::new(CapturingProducer::default());
    let cancel = CancellationToken::new();

    let coordinator = PipelineCoordinator::new(
        source.clone(),
        EnricherChain::new(vec![]),
        Normalizer::new(),
        SinkSet::new(vec![Arc::new(FailingSink)]),
        DeadLetterRouter::new(dlq_producer.clone(), "edr.dlq", true, cancel.clone()),
        options(),
        cancel,
    );
    coordinator.start();

    let done = wait_until(Duration::from_secs(5), || {
        dlq_producer
            .by_topic
            .lock()
            .get("edr.dlq")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    })
    .await;
    assert!(done, "write failure never reached the dead-letter topic");

    coordinator.stop().await;

    let by_topic = dlq_producer.by_topic.lock();
    let envelope: DeadLetterEnvelope = serde_json::from_slice(&by_topic["edr.dlq"][0]).unwrap();
    assert_eq!(envelope.stage.as_str(), "write");
    // The offset was committed at enqueue time regardless of sink fate.
    assert_eq!(source.committed.lock().clone(), vec![0]);
}
