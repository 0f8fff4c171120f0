//! Downstream destinations for normalized events.

pub mod bulk;
pub mod stream;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::{CoreError, Result};
use crate::metrics;
use crate::models::NormalizedEvent;

/// A normalized event plus the routing identity the sinks need.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub agent_id: String,
    pub tenant_id: String,
    pub event: NormalizedEvent,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, record: &SinkRecord) -> Result<()>;

    async fn write_batch(&self, records: &[SinkRecord]) -> Result<()> {
        for record in records {
            self.write(record).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Fan-out over every configured sink. One sink failing does not stop the
/// others from being attempted; failures are combined into one error.
pub struct SinkSet {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub async fn write_batch(&self, records: &[SinkRecord]) -> Result<()> {
        let mut failures = Vec::new();

        for sink in &self.sinks {
            let started = Instant::now();
            match sink.write_batch(records).await {
                Ok(()) => {
                    metrics::inc_sink_write(sink.name(), "ok");
                    metrics::observe_sink_write(sink.name(), started.elapsed().as_secs_f64());
                }
                Err(e) => {
                    metrics::inc_sink_write(sink.name(), "error");
                    metrics::observe_sink_write(sink.name(), started.elapsed().as_secs_f64());
                    tracing::error!(sink = sink.name(), error = %e, "sink write failed");
                    failures.push(format!("{}: {e}", sink.name()));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::sink(failures.join("; ")))
        }
    }

    pub async fn close(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                tracing::warn!(sink = sink.name(), error = %e, "sink close failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;

    pub(crate) fn sample_record(id: &str) -> SinkRecord {
        use crate::models::*;
        let now = Utc::now();
        SinkRecord {
            agent_id: "agent-1".into(),
            tenant_id: "tenant-a".into(),
            event: NormalizedEvent {
                timestamp: now,
                schema_version: SCHEMA_VERSION.into(),
                event: EventMeta {
                    id: id.into(),
                    kind: "event".into(),
                    module: "edr".into(),
                    provider: "dns_query".into(),
                    created: now,
                    ingested: now,
                    category: vec!["network".into()],
                    type_: vec!["protocol".into()],
                },
                host: HostInfo::default(),
                process: None,
                file: None,
                source: None,
                destination: None,
                dns: None,
                labels: Default::default(),
                tags: Vec::new(),
                agent: AgentInfo {
                    id: "agent-1".into(),
                    type_: "edr-agent".into(),
                    version: None,
                    name: None,
                },
            },
        }
    }

    struct FlakySink {
        fail: bool,
        written: Mutex<usize>,
    }

    #[async_trait]
    impl EventSink for FlakySink {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn write(&self, _record: &SinkRecord) -> Result<()> {
            if self.fail {
                return Err(CoreError::sink("down"));
            }
            *self.written.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_failing_sink_does_not_block_the_rest() {
        let good = Arc::new(FlakySink { fail: false, written: Mutex::new(0) });
        let bad = Arc::new(FlakySink { fail: true, written: Mutex::new(0) });
        let set = SinkSet::new(vec![bad, good.clone()]);

        let err = set
            .write_batch(&[sample_record("evt-1"), sample_record("evt-2")])
            .await
            .unwrap_err();
        assert_eq!(*good.written.lock(), 2);
        assert!(err.to_string().contains("flaky"));
    }
}
