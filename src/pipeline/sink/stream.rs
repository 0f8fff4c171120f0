//! Stream sink: normalized events onto the downstream topic.

use std::sync::Arc;

use async_trait::async_trait;

use super::{EventSink, SinkRecord};
use crate::bus::{standard_headers, BusProducer};
use crate::error::Result;

pub struct StreamSink {
    producer: Arc<dyn BusProducer>,
    topic: String,
}

impl StreamSink {
    pub fn new(producer: Arc<dyn BusProducer>, topic: impl Into<String>) -> Self {
        Self { producer, topic: topic.into() }
    }
}

#[async_trait]
impl EventSink for StreamSink {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn write(&self, record: &SinkRecord) -> Result<()> {
        let payload = serde_json::to_vec(&record.event)?;
        let headers = standard_headers(&record.tenant_id);
        self.producer
            .send(&self.topic, record.agent_id.as_bytes(), &payload, &headers)
            .await
    }
}
