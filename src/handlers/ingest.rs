//! Development ingress: event submission onto the raw topic and the
//! heartbeat entry point. Production agents reach the broker and the
//! connection layer directly; these routes mirror that surface for tooling
//! and tests.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::error::{CoreError, Result};
use crate::middleware::TenantId;
use crate::models::{Asset, OnlineRecord, RawEvent, RegisterAssetRequest};
use crate::state::AppState;

/// Group a submitted batch by agent so each group keeps one partitioning
/// key. Ordering within an agent is preserved.
fn group_by_agent(events: Vec<RawEvent>) -> BTreeMap<String, Vec<RawEvent>> {
    let mut by_agent: BTreeMap<String, Vec<RawEvent>> = BTreeMap::new();
    for event in events {
        by_agent.entry(event.agent_id.clone()).or_default().push(event);
    }
    by_agent
}

pub async fn ingest_events(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Json(mut events): Json<Vec<RawEvent>>,
) -> Result<(StatusCode, Json<Value>)> {
    let Some(publisher) = state.publisher.as_ref() else {
        return Err(CoreError::internal("event publisher not configured"));
    };
    if events.is_empty() {
        return Err(CoreError::invalid_request("event batch must not be empty"));
    }

    // The authenticated tenant wins over whatever the payload claims.
    let tenant = tenant_id.to_string();
    for event in &mut events {
        event.tenant_id = tenant.clone();
    }

    let accepted = events.len();
    for (agent_id, group) in group_by_agent(events) {
        publisher
            .produce_batch(&state.raw_topic, &agent_id, &tenant, &group)
            .await?;
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Json(mut request): Json<RegisterAssetRequest>,
) -> Result<Json<Asset>> {
    request.tenant_id = tenant_id.to_string();
    let asset = state.assets.register_or_update(request).await?;
    Ok(Json(asset))
}

pub async fn online_agents(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
) -> Result<Json<Value>> {
    let tenant = tenant_id.to_string();
    let agents = state.tracker.list_online(&tenant).await?;
    let count = state.tracker.count_online(&tenant).await?;
    Ok(Json(json!({ "count": count, "agents": agents })))
}

pub async fn agent_status(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(agent_id): Path<String>,
) -> Result<Json<OnlineRecord>> {
    let record = state
        .tracker
        .get_status(&agent_id)
        .await?
        .filter(|record| record.tenant_id == tenant_id.to_string())
        .ok_or_else(|| CoreError::AssetNotFound(agent_id))?;
    Ok(Json(record))
}

pub async fn asset_stats(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
) -> Result<Json<Value>> {
    let by_status = state.assets.count_by_status(tenant_id).await?;
    let by_status: BTreeMap<&str, i64> = by_status
        .into_iter()
        .map(|(status, count)| (status.as_str(), count))
        .collect();
    let online_now = state
        .tracker
        .count_online(&tenant_id.to_string())
        .await
        .unwrap_or(0);
    Ok(Json(json!({ "by_status": by_status, "online_now": online_now })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_raw;

    #[test]
    fn grouping_keeps_per_agent_order() {
        let mk = |agent: &str, id: &str| {
            let body = serde_json::json!({
                "event_id": id,
                "agent_id": agent,
                "tenant_id": "t",
                "timestamp_ns": 0,
                "kind": "dns_query",
                "dns": {"query_name": "example.com"}
            })
            .to_string();
            parse_raw(body.as_bytes()).unwrap()
        };

        let grouped = group_by_agent(vec![
            mk("agent-b", "evt-1"),
            mk("agent-a", "evt-2"),
            mk("agent-b", "evt-3"),
        ]);
        assert_eq!(grouped.len(), 2);
        let b: Vec<&str> = grouped["agent-b"].iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(b, vec!["evt-1", "evt-3"]);
    }
}
