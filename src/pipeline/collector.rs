//! Size/time-triggered batching of decoded events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::bus::BusMessage;
use crate::models::RawEvent;

/// A decoded event paired with the broker message it came from, so the
/// coordinator can commit and dead-letter with full context.
#[derive(Debug, Clone)]
pub struct PipelineEvent {
    pub raw: RawEvent,
    pub message: BusMessage,
}

/// One unit of work handed to a batch worker: the collected events plus a
/// monotonically increasing id and the emission instant.
#[derive(Debug)]
pub struct Batch {
    pub id: u64,
    pub events: Vec<PipelineEvent>,
    pub created_at: Instant,
}

struct CollectorState {
    buffer: Vec<PipelineEvent>,
    last_flush: Instant,
}

/// Lock-guarded buffer. Emission happens when the buffer reaches the size
/// threshold; the coordinator's timer drives the time threshold via
/// [`BatchCollector::flush`].
pub struct BatchCollector {
    state: Mutex<CollectorState>,
    max_size: usize,
    next_id: AtomicU64,
}

impl BatchCollector {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                buffer: Vec::with_capacity(max_size),
                last_flush: Instant::now(),
            }),
            max_size: max_size.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append one event; returns a full batch when the size trigger fires.
    pub fn add(&self, event: PipelineEvent) -> Option<Batch> {
        let mut state = self.state.lock();
        state.buffer.push(event);
        if state.buffer.len() >= self.max_size {
            Some(self.emit(&mut state))
        } else {
            None
        }
    }

    /// Unconditionally emit whatever is buffered. `None` when empty.
    pub fn flush(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        if state.buffer.is_empty() {
            state.last_flush = Instant::now();
            return None;
        }
        Some(self.emit(&mut state))
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, state: &mut CollectorState) -> Batch {
        let events = std::mem::replace(&mut state.buffer, Vec::with_capacity(self.max_size));
        state.last_flush = Instant::now();
        crate::metrics::inc_batches_emitted();
        Batch {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            events,
            created_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::standard_headers;
    use crate::models::{parse_raw, EventKind};

    fn event(n: u32) -> PipelineEvent {
        let body = serde_json::json!({
            "event_id": format!("evt-{n}"),
            "agent_id": "agent-1",
            "tenant_id": "tenant-a",
            "timestamp_ns": 1_700_000_000_000_000_000i64,
            "kind": "dns_query",
            "dns": {"query_name": "example.com"}
        })
        .to_string();
        PipelineEvent {
            raw: parse_raw(body.as_bytes()).unwrap(),
            message: BusMessage {
                topic: "edr.events.raw".into(),
                partition: 0,
                offset: n as i64,
                key: Some(b"agent-1".to_vec()),
                payload: body.into_bytes(),
                headers: standard_headers("tenant-a"),
            },
        }
    }

    #[test]
    fn size_trigger_emits_full_batch() {
        let collector = BatchCollector::new(3);
        assert!(collector.add(event(0)).is_none());
        assert!(collector.add(event(1)).is_none());
        let batch = collector.add(event(2)).expect("size trigger");
        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.events[0].raw.kind, EventKind::DnsQuery);
        assert!(collector.is_empty());
    }

    #[test]
    fn flush_resets_and_empty_flush_is_none() {
        let collector = BatchCollector::new(100);
        collector.add(event(0));
        collector.add(event(1));
        let batch = collector.flush().expect("non-empty flush");
        assert_eq!(batch.events.len(), 2);
        assert!(collector.flush().is_none());
    }

    #[test]
    fn batch_ids_increase_monotonically() {
        let collector = BatchCollector::new(1);
        let a = collector.add(event(0)).unwrap();
        let b = collector.add(event(1)).unwrap();
        let c = collector.flush();
        assert!(c.is_none());
        let d = collector.add(event(2)).unwrap();
        assert!(a.id < b.id && b.id < d.id);
    }
}
