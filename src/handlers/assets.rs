//! Asset endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use uuid::Uuid;

use crate::assets::repository::ListAssetsOptions;
use crate::error::Result;
use crate::middleware::TenantId;
use crate::models::{
    normalize_pagination, Asset, AssetListQuery, ChangeLogEntry, ChangeLogQuery, Page,
    SoftwareRecord, SoftwareSearchQuery, UpdateAssetRequest,
};
use crate::state::AppState;

pub async fn list_assets(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Query(query): Query<AssetListQuery>,
) -> Result<Json<Page<Asset>>> {
    let opts = ListAssetsOptions::from_query(&query)?;
    let page = state.assets.list_assets(tenant_id, opts).await?;
    Ok(Json(page))
}

pub async fn get_asset(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
) -> Result<Json<Asset>> {
    let asset = state.assets.get_asset(tenant_id, id).await?;
    Ok(Json(asset))
}

pub async fn update_asset(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
    Json(patch): Json<UpdateAssetRequest>,
) -> Result<Json<Asset>> {
    let asset = state.assets.update_asset(tenant_id, id, patch).await?;
    Ok(Json(asset))
}

pub async fn delete_asset(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.assets.delete_asset(tenant_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn asset_software(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
    Query(query): Query<SoftwareSearchQuery>,
) -> Result<Json<Page<SoftwareRecord>>> {
    // Asset lookup enforces tenant scope and yields 404 for foreign ids.
    let asset = state.assets.get_asset(tenant_id, id).await?;
    let (page, page_size) = normalize_pagination(query.page, query.page_size);
    let software = state
        .software
        .list_by_asset(tenant_id, asset.id, page, page_size)
        .await?;
    Ok(Json(software))
}

pub async fn replace_asset_software(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
    Json(reports): Json<Vec<crate::models::SoftwareReport>>,
) -> Result<Json<serde_json::Value>> {
    let asset = state.assets.get_asset(tenant_id, id).await?;
    let replaced = state
        .software
        .replace_for_asset(tenant_id, asset.id, &reports)
        .await?;
    Ok(Json(serde_json::json!({ "replaced": replaced })))
}

pub async fn asset_changes(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChangeLogQuery>,
) -> Result<Json<Page<ChangeLogEntry>>> {
    let changes = state.assets.changes(tenant_id, id, query).await?;
    Ok(Json(changes))
}
