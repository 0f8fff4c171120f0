//! Admin API routing.

use axum::middleware::from_fn;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::require_tenant;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let tenant_scoped = Router::new()
        .route("/assets", get(handlers::assets::list_assets))
        .route("/assets/:id", get(handlers::assets::get_asset))
        .route("/assets/:id", put(handlers::assets::update_asset))
        .route("/assets/:id", delete(handlers::assets::delete_asset))
        .route("/assets/:id/software", get(handlers::assets::asset_software))
        .route("/assets/:id/software", put(handlers::assets::replace_asset_software))
        .route("/assets/:id/changes", get(handlers::assets::asset_changes))
        .route("/asset-groups", get(handlers::groups::group_tree))
        .route("/asset-groups", post(handlers::groups::create_group))
        .route("/asset-groups/:id", put(handlers::groups::update_group))
        .route("/asset-groups/:id", delete(handlers::groups::delete_group))
        .route("/asset-groups/:id/assets", post(handlers::groups::assign_asset))
        .route("/asset-groups/:id/assets", get(handlers::groups::group_assets))
        .route(
            "/asset-groups/:id/assets/:asset_id",
            delete(handlers::groups::remove_asset),
        )
        .route(
            "/asset-groups/:id/ancestors",
            get(handlers::groups::group_ancestors),
        )
        .route("/software/search", get(handlers::software::search_software))
        .route("/assets/stats", get(handlers::ingest::asset_stats))
        .route("/agents/heartbeat", post(handlers::ingest::heartbeat))
        .route("/agents/online", get(handlers::ingest::online_agents))
        .route("/agents/:agent_id/status", get(handlers::ingest::agent_status))
        .route("/ingest/events", post(handlers::ingest::ingest_events))
        .layer(from_fn(require_tenant));

    Router::new()
        .route("/health", get(handlers::health::health))
        .merge(tenant_scoped)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
