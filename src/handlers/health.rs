//! Liveness/readiness reporting for the core's components.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::pipeline::PipelineState;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let database = match sqlx::query("SELECT 1").fetch_one(&state.pg_pool).await {
        Ok(_) => "up",
        Err(e) => {
            tracing::warn!(error = %e, "database health probe failed");
            "down"
        }
    };

    let kv = match state.tracker.is_online("health-probe").await {
        Ok(_) => "up",
        Err(e) => {
            tracing::warn!(error = %e, "kv health probe failed");
            "down"
        }
    };

    let pipeline = match state.pipeline.as_ref().map(|p| p.state()) {
        Some(PipelineState::Running) => "running",
        Some(PipelineState::Idle) => "idle",
        Some(PipelineState::Stopping) => "stopping",
        Some(PipelineState::Stopped) => "stopped",
        None => "disabled",
    };

    let healthy = database == "up" && kv == "up" && pipeline != "stopped";
    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "components": {
            "database": database,
            "kv": kv,
            "pipeline": pipeline,
        }
    }))
}
