//! Software inventory search.

use axum::extract::{Query, State};
use axum::{Extension, Json};

use crate::error::{CoreError, Result};
use crate::middleware::TenantId;
use crate::models::{normalize_pagination, Page, SoftwareRecord, SoftwareSearchQuery};
use crate::state::AppState;

pub async fn search_software(
    State(state): State<AppState>,
    Extension(TenantId(tenant_id)): Extension<TenantId>,
    Query(query): Query<SoftwareSearchQuery>,
) -> Result<Json<Page<SoftwareRecord>>> {
    let name = query
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| CoreError::invalid_request("name query parameter is required"))?;

    let (page, page_size) = normalize_pagination(query.page, query.page_size);
    let results = state
        .software
        .search(tenant_id, name, page, page_size)
        .await?;
    Ok(Json(results))
}
