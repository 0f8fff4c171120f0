//! Prometheus metrics for the pipeline and asset subsystems.
//!
//! Exposition is handled by the surrounding deployment; this module only
//! registers and updates the series.

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static EVENTS_CONSUMED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("edr_events_consumed_total", "Raw messages consumed by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static EVENTS_NORMALIZED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("edr_events_normalized_total", "Events normalized by kind and outcome"),
        &["kind", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static ENRICH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("edr_enrich_failures_total", "Enricher failures by enricher name"),
        &["enricher"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static DLQ_ROUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("edr_dlq_routed_total", "Messages routed to the dead-letter topic by stage"),
        &["stage"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static SINK_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("edr_sink_writes_total", "Sink writes by sink and outcome"),
        &["sink", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static SINK_WRITE_SECS: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        HistogramOpts::new("edr_sink_write_seconds", "Sink write latency seconds"),
        &["sink"],
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

static BATCHES_EMITTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("edr_batches_emitted_total", "Batches handed to workers").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static BATCH_PROCESS_SECS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "edr_batch_process_seconds",
        "Per-batch processing latency seconds",
    ))
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

static COMMITS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("edr_offset_commits_total", "Broker offset commits").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static BULK_FLUSHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("edr_bulk_items_total", "Bulk indexer items by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static HEARTBEATS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("edr_heartbeats_total", "Agent heartbeats by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static ASSETS_DEMOTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "edr_assets_demoted_total",
        "Assets moved to offline by the reconciler",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static CHANGELOG_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "edr_changelog_failures_total",
        "Change-log writes that failed without aborting the mutation",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static PIPELINE_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("edr_pipeline_running", "1 while the coordinator is running").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub fn inc_consumed(outcome: &str) {
    EVENTS_CONSUMED.with_label_values(&[outcome]).inc();
}

pub fn inc_normalized(kind: &str, outcome: &str) {
    EVENTS_NORMALIZED.with_label_values(&[kind, outcome]).inc();
}

pub fn inc_enrich_failure(enricher: &str) {
    ENRICH_FAILURES.with_label_values(&[enricher]).inc();
}

pub fn inc_dlq_routed(stage: &str) {
    DLQ_ROUTED.with_label_values(&[stage]).inc();
}

pub fn inc_sink_write(sink: &str, outcome: &str) {
    SINK_WRITES.with_label_values(&[sink, outcome]).inc();
}

pub fn observe_sink_write(sink: &str, seconds: f64) {
    SINK_WRITE_SECS.with_label_values(&[sink]).observe(seconds);
}

pub fn inc_batches_emitted() {
    BATCHES_EMITTED.inc();
}

pub fn observe_batch_process(seconds: f64) {
    BATCH_PROCESS_SECS.observe(seconds);
}

pub fn inc_commits() {
    COMMITS.inc();
}

pub fn inc_bulk_items(outcome: &str, n: u64) {
    BULK_FLUSHED.with_label_values(&[outcome]).inc_by(n);
}

pub fn inc_heartbeat(outcome: &str) {
    HEARTBEATS.with_label_values(&[outcome]).inc();
}

pub fn inc_assets_demoted_by(n: u64) {
    ASSETS_DEMOTED.inc_by(n);
}

pub fn inc_changelog_failure() {
    CHANGELOG_FAILURES.inc();
}

pub fn set_pipeline_running(running: bool) {
    PIPELINE_RUNNING.set(if running { 1 } else { 0 });
}
