//! Periodic reconciliation of durable status against KV liveness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::assets::repository::AssetRepository;
use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::metrics;
use crate::models::{AssetStatus, HeartbeatInfo};
use crate::tracker::LivenessTracker;

/// Scans the durable store for assets still marked online whose tracker
/// record has expired, and demotes them in batches.
pub struct StatusReconciler {
    repository: Arc<dyn AssetRepository>,
    tracker: Arc<dyn LivenessTracker>,
    interval: Duration,
    batch_size: usize,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatusReconciler {
    pub fn new(
        repository: Arc<dyn AssetRepository>,
        tracker: Arc<dyn LivenessTracker>,
        cfg: &ReconcilerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repository,
            tracker,
            interval: Duration::from_secs(cfg.scan_interval_secs),
            batch_size: cfg.batch_size.max(1),
            cancel,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the background loop. The first scan runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return;
        }

        let reconciler = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tracing::info!(
                interval_secs = reconciler.interval.as_secs(),
                "status reconciler started"
            );
            loop {
                if let Err(e) = reconciler.scan_once().await {
                    tracing::error!(error = %e, "reconciliation scan failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(reconciler.interval) => {}
                    _ = reconciler.cancel.cancelled() => break,
                }
            }
            tracing::info!("status reconciler stopped");
        }));
    }

    /// Cancel the loop and wait for it to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One pass: collect online rows missing from the tracker and demote
    /// them. A tracker error for an individual asset skips that asset
    /// rather than demoting it on bad evidence.
    pub async fn scan_once(&self) -> Result<u64> {
        let online = self.repository.get_all_online_assets().await?;
        if online.is_empty() {
            return Ok(0);
        }

        let mut stale: Vec<Uuid> = Vec::new();
        for asset in &online {
            match self.tracker.is_online(&asset.agent_id).await {
                Ok(true) => {}
                Ok(false) => stale.push(asset.id),
                Err(e) => {
                    tracing::warn!(
                        agent_id = %asset.agent_id,
                        error = %e,
                        "tracker check failed, skipping asset"
                    );
                }
            }
        }

        let mut demoted = 0u64;
        for chunk in stale.chunks(self.batch_size) {
            demoted += self
                .repository
                .batch_update_status(chunk, AssetStatus::Offline)
                .await?;
        }
        if demoted > 0 {
            metrics::inc_assets_demoted_by(demoted);
            tracing::info!(demoted, checked = online.len(), "stale assets moved offline");
        }
        Ok(demoted)
    }
}

/// Unified heartbeat entry point for the ingress layer: refresh the tracker
/// best-effort, then stamp the durable row. Only the durable-store error
/// propagates.
pub async fn handle_heartbeat(
    repository: &dyn AssetRepository,
    tracker: &dyn LivenessTracker,
    tenant_id: Uuid,
    agent_id: &str,
    info: &HeartbeatInfo,
) -> Result<()> {
    if let Err(e) = tracker
        .update_heartbeat(agent_id, &tenant_id.to_string(), info)
        .await
    {
        metrics::inc_heartbeat("tracker_error");
        tracing::warn!(agent_id, error = %e, "tracker heartbeat failed");
    }
    repository
        .update_last_seen(tenant_id, agent_id, Utc::now())
        .await
}
