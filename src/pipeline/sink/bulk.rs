//! Bulk indexer for the search sink.
//!
//! Items accumulate in memory and are shipped as one NDJSON `_bulk`
//! request when the count, byte, or age trigger fires. Per-item failures
//! reported by the search store are aggregated and surfaced through the
//! `on_error` callback without failing the flush.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{EventSink, SinkRecord};
use crate::config::BulkIndexerConfig;
use crate::error::{CoreError, Result};
use crate::metrics;

pub type ErrorCallback = Box<dyn Fn(&CoreError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Index,
    Create,
    Delete,
}

impl BulkAction {
    fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Create => "create",
            BulkAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkItem {
    pub action: BulkAction,
    pub index: String,
    pub id: Option<String>,
    pub routing: Option<String>,
    pub pipeline: Option<String>,
    pub document: Option<serde_json::Value>,
}

impl BulkItem {
    /// Meta line followed, unless the action is delete, by the document
    /// line; both newline-terminated.
    fn encode(&self, out: &mut String) {
        let mut meta = serde_json::Map::new();
        meta.insert("_index".to_string(), self.index.clone().into());
        if let Some(id) = &self.id {
            meta.insert("_id".to_string(), id.clone().into());
        }
        if let Some(routing) = &self.routing {
            meta.insert("routing".to_string(), routing.clone().into());
        }
        if let Some(pipeline) = &self.pipeline {
            meta.insert("pipeline".to_string(), pipeline.clone().into());
        }
        let action = serde_json::json!({ self.action.as_str(): meta });
        out.push_str(&action.to_string());
        out.push('\n');

        if self.action != BulkAction::Delete {
            if let Some(document) = &self.document {
                out.push_str(&document.to_string());
            } else {
                out.push_str("{}");
            }
            out.push('\n');
        }
    }

    fn approx_bytes(&self) -> usize {
        let doc = self
            .document
            .as_ref()
            .map(|d| d.to_string().len())
            .unwrap_or(2);
        // Meta line overhead is small and stable; 64 covers it.
        doc + self.index.len() + 64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkStats {
    pub num_added: u64,
    pub num_flushed: u64,
    pub num_failed: u64,
    pub in_buffer: usize,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

pub struct BulkIndexer {
    client: reqwest::Client,
    base_url: String,
    index_prefix: String,
    batch_size: usize,
    flush_bytes: usize,
    flush_interval: Duration,
    max_retries: u8,
    close_drain: Duration,

    buffer: Mutex<Vec<BulkItem>>,
    buffer_len: AtomicUsize,
    current_bytes: AtomicUsize,
    last_flush: Mutex<Instant>,

    num_added: AtomicU64,
    num_flushed: AtomicU64,
    num_failed: AtomicU64,

    on_error: Option<ErrorCallback>,
}

impl BulkIndexer {
    pub fn new(cfg: &BulkIndexerConfig, on_error: Option<ErrorCallback>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoreError::config(format!("failed to build search client: {e}")))?;

        Ok(Self {
            client,
            base_url: cfg.search_url.trim_end_matches('/').to_string(),
            index_prefix: cfg.index_prefix.clone(),
            batch_size: cfg.batch_size.max(1),
            flush_bytes: cfg.flush_bytes.max(1),
            flush_interval: cfg.flush_interval(),
            max_retries: cfg.max_retries,
            close_drain: Duration::from_secs(5),
            buffer: Mutex::new(Vec::new()),
            buffer_len: AtomicUsize::new(0),
            current_bytes: AtomicUsize::new(0),
            last_flush: Mutex::new(Instant::now()),
            num_added: AtomicU64::new(0),
            num_flushed: AtomicU64::new(0),
            num_failed: AtomicU64::new(0),
            on_error,
        })
    }

    /// Daily index name for the given timestamp.
    pub fn index_for(&self, t: DateTime<Utc>) -> String {
        format!("{}-{}", self.index_prefix, t.format("%Y.%m.%d"))
    }

    /// Append one item, flushing when the count or byte trigger fires.
    pub async fn add(&self, item: BulkItem) -> Result<()> {
        let bytes = item.approx_bytes();
        {
            let mut buffer = self.buffer.lock();
            buffer.push(item);
        }
        let len = self.buffer_len.fetch_add(1, Ordering::SeqCst) + 1;
        let total_bytes = self.current_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.num_added.fetch_add(1, Ordering::SeqCst);

        if len >= self.batch_size || total_bytes >= self.flush_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    /// Ship everything buffered. Per-item failures are counted and passed
    /// to `on_error`; only a whole-request failure after retries is an
    /// error.
    pub async fn flush(&self) -> Result<()> {
        let items: Vec<BulkItem> = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if items.is_empty() {
            *self.last_flush.lock() = Instant::now();
            return Ok(());
        }

        let removed_bytes: usize = items.iter().map(BulkItem::approx_bytes).sum();
        self.buffer_len.fetch_sub(items.len(), Ordering::SeqCst);
        self.current_bytes.fetch_sub(removed_bytes, Ordering::SeqCst);
        *self.last_flush.lock() = Instant::now();

        let mut body = String::with_capacity(removed_bytes);
        for item in &items {
            item.encode(&mut body);
        }

        match self.send_bulk(body, items.len()).await {
            Ok((ok, failed, failure_detail)) => {
                self.num_flushed.fetch_add(ok, Ordering::SeqCst);
                self.num_failed.fetch_add(failed, Ordering::SeqCst);
                metrics::inc_bulk_items("flushed", ok);
                if failed > 0 {
                    metrics::inc_bulk_items("failed", failed);
                    let err = CoreError::sink(format!(
                        "{failed} of {} bulk items rejected: {failure_detail}",
                        items.len()
                    ));
                    tracing::warn!(error = %err, "partial bulk failure");
                    if let Some(on_error) = &self.on_error {
                        on_error(&err);
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.num_failed
                    .fetch_add(items.len() as u64, Ordering::SeqCst);
                metrics::inc_bulk_items("failed", items.len() as u64);
                if let Some(on_error) = &self.on_error {
                    on_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Flush when the age trigger has fired.
    pub async fn flush_if_stale(&self) -> Result<()> {
        let stale = self.last_flush.lock().elapsed() >= self.flush_interval;
        if stale && self.buffer_len.load(Ordering::SeqCst) > 0 {
            self.flush().await
        } else {
            Ok(())
        }
    }

    /// Background age-trigger loop.
    pub fn spawn_ticker(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(indexer.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = indexer.flush_if_stale().await {
                            tracing::error!(error = %e, "scheduled bulk flush failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Drain residual items within `deadline`.
    pub async fn close(&self, deadline: Duration) -> Result<()> {
        match tokio::time::timeout(deadline, self.flush()).await {
            Ok(result) => result,
            Err(_) => {
                let stats = self.stats();
                tracing::warn!(in_buffer = stats.in_buffer, "bulk close deadline exceeded");
                Err(CoreError::timeout("bulk indexer close"))
            }
        }
    }

    pub fn stats(&self) -> BulkStats {
        BulkStats {
            num_added: self.num_added.load(Ordering::SeqCst),
            num_flushed: self.num_flushed.load(Ordering::SeqCst),
            num_failed: self.num_failed.load(Ordering::SeqCst),
            in_buffer: self.buffer_len.load(Ordering::SeqCst),
        }
    }

    /// Create the daily index for `t`. Calling it again for the same day
    /// succeeds: an already-exists conflict is ignored.
    pub async fn create_time_based_index(&self, t: DateTime<Utc>) -> Result<String> {
        let index = self.index_for(t);
        let url = format!("{}/{}", self.base_url, index);
        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| CoreError::sink(format!("index create request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(index);
        }
        let body = response.text().await.unwrap_or_default();
        if body.contains("resource_already_exists_exception") {
            return Ok(index);
        }
        Err(CoreError::sink(format!(
            "index create failed with {status}: {body}"
        )))
    }

    async fn send_bulk(&self, body: String, item_count: usize) -> Result<(u64, u64, String)> {
        let url = format!("{}/_bulk", self.base_url);
        let mut backoff = Duration::from_millis(500);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            let result = self
                .client
                .post(&url)
                .header("content-type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    let parsed: BulkResponse = response
                        .json()
                        .await
                        .map_err(|e| CoreError::sink(format!("bad bulk response: {e}")))?;
                    return Ok(tally_items(&parsed, item_count));
                }
                Ok(response) => {
                    let status = response.status();
                    let err = CoreError::sink(format!("bulk request returned {status}"));
                    // Client errors are not going to heal on retry.
                    if status.is_client_error() {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
                Err(e) => {
                    last_err = Some(CoreError::sink(format!("bulk request failed: {e}")));
                }
            }

            if attempt < self.max_retries {
                tracing::warn!(attempt, "bulk request failed, backing off");
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::sink("bulk retries exhausted")))
    }
}

fn tally_items(response: &BulkResponse, item_count: usize) -> (u64, u64, String) {
    if !response.errors {
        return (item_count as u64, 0, String::new());
    }

    let mut ok = 0u64;
    let mut failed = 0u64;
    let mut reasons = Vec::new();
    for item in &response.items {
        let result = item.as_object().and_then(|o| o.values().next());
        let status = result
            .and_then(|r| r.get("status"))
            .and_then(|s| s.as_u64())
            .unwrap_or(500);
        if status < 300 {
            ok += 1;
        } else {
            failed += 1;
            if let Some(reason) = result
                .and_then(|r| r.get("error"))
                .and_then(|e| e.get("reason"))
                .and_then(|r| r.as_str())
            {
                if reasons.len() < 5 {
                    reasons.push(reason.to_string());
                }
            }
        }
    }
    // The response should cover every item; treat anything unaccounted for
    // as failed rather than silently dropped.
    let accounted = ok + failed;
    if (accounted as usize) < item_count {
        failed += item_count as u64 - accounted;
    }
    (ok, failed, reasons.join("; "))
}

#[async_trait]
impl EventSink for BulkIndexer {
    fn name(&self) -> &'static str {
        "bulk_index"
    }

    async fn write(&self, record: &SinkRecord) -> Result<()> {
        let item = BulkItem {
            action: BulkAction::Index,
            index: self.index_for(record.event.timestamp),
            id: Some(record.event.event.id.clone()),
            routing: Some(record.agent_id.clone()),
            pipeline: None,
            document: Some(serde_json::to_value(&record.event)?),
        };
        self.add(item).await
    }

    async fn close(&self) -> Result<()> {
        BulkIndexer::close(self, self.close_drain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(action: BulkAction, id: &str) -> BulkItem {
        BulkItem {
            action,
            index: "edr-events-2026.08.01".into(),
            id: Some(id.into()),
            routing: Some("agent-1".into()),
            pipeline: None,
            document: Some(serde_json::json!({"event": {"id": id}})),
        }
    }

    #[test]
    fn encode_produces_meta_then_document_lines() {
        let mut body = String::new();
        item(BulkAction::Index, "evt-1").encode(&mut body);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let meta: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(meta["index"]["_index"], "edr-events-2026.08.01");
        assert_eq!(meta["index"]["_id"], "evt-1");
        assert_eq!(meta["index"]["routing"], "agent-1");
        let doc: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["event"]["id"], "evt-1");
    }

    #[test]
    fn delete_skips_the_document_line() {
        let mut body = String::new();
        item(BulkAction::Delete, "evt-2").encode(&mut body);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 1);
        let meta: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert!(meta.get("delete").is_some());
    }

    #[test]
    fn index_name_is_daily() {
        let indexer =
            BulkIndexer::new(&crate::config::BulkIndexerConfig::default(), None).unwrap();
        let t = DateTime::parse_from_rfc3339("2026-08-01T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(indexer.index_for(t), "edr-events-2026.08.01");
    }

    #[test]
    fn tally_counts_partial_failures() {
        let response: BulkResponse = serde_json::from_value(serde_json::json!({
            "errors": true,
            "items": [
                {"index": {"status": 201}},
                {"index": {"status": 429, "error": {"reason": "rejected"}}},
                {"index": {"status": 200}}
            ]
        }))
        .unwrap();
        let (ok, failed, detail) = tally_items(&response, 3);
        assert_eq!((ok, failed), (2, 1));
        assert!(detail.contains("rejected"));
    }
}
