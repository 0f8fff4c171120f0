//! Asset-group endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use uuid::Uuid;

use crate::assets::repository::ListAssetsOptions;
use crate::error::Result;
use crate::middleware::TenantId;
use crate::models::{
    Asset, AssetGroup, AssetListQuery, AssignAssetRequest, CreateGroupRequest, GroupTreeNode,
    Page, UpdateGroupRequest,
};
use crate::state::AppState;

pub async fn group_tree(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
) -> Result<Json<Vec<GroupTreeNode>>> {
    let forest = state.groups.tree(tenant_id).await?;
    Ok(Json(forest))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<AssetGroup>)> {
    let group = state.groups.create(tenant_id, request).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn update_group(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
    Json(patch): Json<UpdateGroupRequest>,
) -> Result<Json<AssetGroup>> {
    let group = state.groups.update(tenant_id, id, patch).await?;
    Ok(Json(group))
}

pub async fn delete_group(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.groups.delete(tenant_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn assign_asset(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
    Json(request): Json<AssignAssetRequest>,
) -> Result<StatusCode> {
    state.groups.assign(tenant_id, id, request.asset_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_asset(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path((id, asset_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode> {
    state.groups.remove(tenant_id, id, asset_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn group_ancestors(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AssetGroup>>> {
    let ancestors = state.groups.ancestors(tenant_id, id).await?;
    Ok(Json(ancestors))
}

pub async fn group_assets(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Path(id): Path<Uuid>,
    Query(query): Query<AssetListQuery>,
) -> Result<Json<Page<Asset>>> {
    // 404 for unknown or foreign groups before listing members.
    let group = state.groups.get(tenant_id, id).await?;
    let mut opts = ListAssetsOptions::from_query(&query)?;
    opts.group_id = Some(group.id);
    let page = state.assets.list_assets(tenant_id, opts).await?;
    Ok(Json(page))
}
