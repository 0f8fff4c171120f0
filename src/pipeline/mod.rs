//! Pipeline coordinator: consume → collect → enrich → normalize → fan out,
//! with dead-letter routing at every failure point.

pub mod collector;
pub mod enrich;
pub mod normalize;
pub mod sink;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::dlq::{DeadLetterEnvelope, DeadLetterRouter, DlqSource, FailureStage};
use crate::bus::{BusMessage, MessageSource};
use crate::error::{CoreError, Result};
use crate::metrics;
use crate::models::parse_raw;

pub use collector::{Batch, BatchCollector, PipelineEvent};
pub use enrich::{Enricher, EnricherChain};
pub use normalize::Normalizer;
pub use sink::{EventSink, SinkRecord, SinkSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub consume_workers: usize,
    pub batch_workers: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub fetch_max_wait: Duration,
    pub message_buffer: usize,
    pub error_buffer: usize,
    pub shutdown_timeout: Duration,
    pub sink_max_retries: u8,
}

impl PipelineOptions {
    pub fn from_config(pipeline: &crate::config::PipelineConfig, kafka: &crate::config::KafkaConfig) -> Self {
        Self {
            consume_workers: pipeline.consume_workers.max(1),
            batch_workers: pipeline.batch_workers.max(1),
            batch_size: pipeline.batch_size,
            batch_timeout: pipeline.batch_timeout(),
            fetch_max_wait: Duration::from_millis(kafka.fetch_max_wait_ms),
            message_buffer: pipeline.message_buffer,
            error_buffer: pipeline.error_buffer,
            shutdown_timeout: pipeline.shutdown_timeout(),
            sink_max_retries: pipeline.sink_max_retries,
        }
    }
}

pub struct PipelineCoordinator {
    source: Arc<dyn MessageSource>,
    collector: Arc<BatchCollector>,
    enrichers: Arc<EnricherChain>,
    normalizer: Arc<Normalizer>,
    sinks: Arc<SinkSet>,
    dlq: Arc<DeadLetterRouter>,
    options: PipelineOptions,
    state: Mutex<PipelineState>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineCoordinator {
    pub fn new(
        source: Arc<dyn MessageSource>,
        enrichers: EnricherChain,
        normalizer: Normalizer,
        sinks: SinkSet,
        dlq: DeadLetterRouter,
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            collector: Arc::new(BatchCollector::new(options.batch_size)),
            enrichers: Arc::new(enrichers),
            normalizer: Arc::new(normalizer),
            sinks: Arc::new(sinks),
            dlq: Arc::new(dlq),
            options,
            state: Mutex::new(PipelineState::Idle),
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Spawn the consume workers, the collector loop, the flush timer and
    /// the batch worker pool. Idempotent.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if *state == PipelineState::Running {
                return;
            }
            *state = PipelineState::Running;
        }
        metrics::set_pipeline_running(true);
        tracing::info!(
            consume_workers = self.options.consume_workers,
            batch_workers = self.options.batch_workers,
            batch_size = self.options.batch_size,
            "pipeline starting"
        );

        let (event_tx, event_rx) = mpsc::channel::<PipelineEvent>(self.options.message_buffer);
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(self.options.batch_workers * 2);
        let (error_tx, error_rx) = mpsc::channel::<CoreError>(self.options.error_buffer);

        let mut handles = self.handles.lock();

        for worker in 0..self.options.consume_workers {
            handles.push(self.spawn_consume_worker(worker, event_tx.clone(), error_tx.clone()));
        }
        drop(event_tx);

        handles.push(self.spawn_collector_loop(event_rx, batch_tx.clone()));
        handles.push(self.spawn_flush_timer(batch_tx));
        handles.push(Self::spawn_error_drain(error_rx));

        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));
        for worker in 0..self.options.batch_workers {
            handles.push(self.spawn_batch_worker(worker, Arc::clone(&batch_rx), error_tx.clone()));
        }
    }

    /// Cancel every loop, drain outstanding work within the shutdown
    /// deadline, then close the sinks. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                PipelineState::Running => *state = PipelineState::Stopping,
                _ => return,
            }
        }
        tracing::info!("pipeline stopping");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.options.shutdown_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                outstanding = self.collector.len(),
                "shutdown deadline exceeded, abandoning outstanding work"
            );
        }

        self.sinks.close().await;
        self.enrichers.close().await;
        *self.state.lock() = PipelineState::Stopped;
        metrics::set_pipeline_running(false);
        tracing::info!("pipeline stopped");
    }

    fn spawn_consume_worker(
        &self,
        worker: usize,
        event_tx: mpsc::Sender<PipelineEvent>,
        error_tx: mpsc::Sender<CoreError>,
    ) -> JoinHandle<()> {
        let source = Arc::clone(&self.source);
        let dlq = Arc::clone(&self.dlq);
        let cancel = self.cancel.clone();
        let max_wait = self.options.fetch_max_wait;

        tokio::spawn(async move {
            tracing::debug!(worker, "consume worker started");
            while !cancel.is_cancelled() {
                let message = match source.fetch(max_wait).await {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!(worker, error = %e, "fetch failed");
                        let _ = error_tx.try_send(e);
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            _ = cancel.cancelled() => break,
                        }
                    }
                };

                match parse_raw(&message.payload) {
                    Err(e) => {
                        // Terminal: envelope to the DLQ, then commit so the
                        // poisoned offset is never re-read.
                        metrics::inc_consumed("parse_error");
                        let mut envelope = DeadLetterEnvelope::from_message(
                            &message,
                            &e.to_string(),
                            "parse_error",
                            FailureStage::Parse,
                            DlqSource::Consumer,
                        );
                        if let Err(e) = dlq.route_with_retry(&mut envelope).await {
                            tracing::error!(worker, error = %e, "dead-letter routing failed");
                        }
                        if let Err(e) = source.commit(std::slice::from_ref(&message)).await {
                            tracing::error!(worker, error = %e, "commit failed");
                        }
                    }
                    Ok(raw) => {
                        metrics::inc_consumed("ok");
                        let event = PipelineEvent { raw, message: message.clone() };
                        // Backpressure: block here while the buffer is full.
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                        // At-least-once: commit only after the enqueue.
                        if let Err(e) = source.commit(std::slice::from_ref(&message)).await {
                            tracing::error!(worker, error = %e, "commit failed");
                        }
                    }
                }
            }
            tracing::debug!(worker, "consume worker stopped");
        })
    }

    fn spawn_collector_loop(
        &self,
        mut event_rx: mpsc::Receiver<PipelineEvent>,
        batch_tx: mpsc::Sender<Batch>,
    ) -> JoinHandle<()> {
        let collector = Arc::clone(&self.collector);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let Some(batch) = collector.add(event) {
                    if batch_tx.send(batch).await.is_err() {
                        return;
                    }
                }
            }
            // Producers are gone; hand off whatever is left.
            if let Some(batch) = collector.flush() {
                let _ = batch_tx.send(batch).await;
            }
        })
    }

    fn spawn_flush_timer(&self, batch_tx: mpsc::Sender<Batch>) -> JoinHandle<()> {
        let collector = Arc::clone(&self.collector);
        let cancel = self.cancel.clone();
        let period = self.options.batch_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(batch) = collector.flush() {
                            if batch_tx.send(batch).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }

    fn spawn_error_drain(mut error_rx: mpsc::Receiver<CoreError>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(e) = error_rx.recv().await {
                tracing::warn!(error = %e, "pipeline worker error");
            }
        })
    }

    fn spawn_batch_worker(
        &self,
        worker: usize,
        batch_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
        error_tx: mpsc::Sender<CoreError>,
    ) -> JoinHandle<()> {
        let enrichers = Arc::clone(&self.enrichers);
        let normalizer = Arc::clone(&self.normalizer);
        let sinks = Arc::clone(&self.sinks);
        let dlq = Arc::clone(&self.dlq);
        let max_retries = self.options.sink_max_retries;

        tokio::spawn(async move {
            loop {
                let batch = {
                    let mut rx = batch_rx.lock().await;
                    rx.recv().await
                };
                let Some(batch) = batch else { break };

                let started = Instant::now();
                let batch_id = batch.id;
                let size = batch.events.len();
                if let Err(e) =
                    process_batch(batch, &enrichers, &normalizer, &sinks, &dlq, max_retries).await
                {
                    tracing::error!(worker, batch_id, error = %e, "batch processing failed");
                    let _ = error_tx.try_send(e);
                }
                metrics::observe_batch_process(started.elapsed().as_secs_f64());
                tracing::debug!(worker, batch_id, size, "batch processed");
            }
        })
    }
}

/// Run one batch through the chain. A single bad event never tears down the
/// batch: failures are enveloped per event and sent to the DLQ tagged with
/// the stage that rejected them.
async fn process_batch(
    batch: Batch,
    enrichers: &EnricherChain,
    normalizer: &Normalizer,
    sinks: &SinkSet,
    dlq: &DeadLetterRouter,
    sink_max_retries: u8,
) -> Result<()> {
    let mut processed: Vec<(BusMessage, SinkRecord)> = Vec::with_capacity(batch.events.len());
    let mut failed: Vec<(BusMessage, CoreError)> = Vec::new();

    for mut event in batch.events {
        enrichers.apply(&mut event.raw).await;

        match normalizer.normalize(&event.raw) {
            Ok(normalized) => {
                metrics::inc_normalized(event.raw.kind.as_str(), "ok");
                processed.push((
                    event.message,
                    SinkRecord {
                        agent_id: event.raw.agent_id.clone(),
                        tenant_id: event.raw.tenant_id.clone(),
                        event: normalized,
                    },
                ));
            }
            Err(e) => {
                metrics::inc_normalized(event.raw.kind.as_str(), "error");
                failed.push((event.message, e));
            }
        }
    }

    for (message, error) in &failed {
        let mut envelope = DeadLetterEnvelope::from_message(
            message,
            &error.to_string(),
            "normalize_error",
            FailureStage::Normalize,
            DlqSource::Consumer,
        );
        if let Err(e) = dlq.route_with_retry(&mut envelope).await {
            tracing::error!(error = %e, "dead-letter routing failed");
        }
    }

    if processed.is_empty() {
        return Ok(());
    }

    let records: Vec<SinkRecord> = processed.iter().map(|(_, r)| r.clone()).collect();
    let mut backoff = Duration::from_millis(200);
    let mut last_err = None;

    for attempt in 0..sink_max_retries.max(1) {
        match sinks.write_batch(&records).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "sink fan-out failed");
                last_err = Some(e);
            }
        }
        if attempt + 1 < sink_max_retries.max(1) {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    // Retry budget exhausted: every event in this batch goes to the DLQ.
    let error = last_err.unwrap_or_else(|| CoreError::sink("sink retries exhausted"));
    for (message, _) in &processed {
        let mut envelope = DeadLetterEnvelope::from_message(
            message,
            &error.to_string(),
            "sink_error",
            FailureStage::Write,
            DlqSource::Consumer,
        );
        if let Err(e) = dlq.route_with_retry(&mut envelope).await {
            tracing::error!(error = %e, "dead-letter routing failed");
        }
    }
    Err(error)
}
