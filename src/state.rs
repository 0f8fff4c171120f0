//! Shared application state for the admin surface.

use std::sync::Arc;

use sqlx::postgres::PgPool;

use crate::assets::service::AssetService;
use crate::assets::groups::GroupService;
use crate::assets::software::SoftwareRepository;
use crate::bus::BusProducer;
use crate::pipeline::PipelineCoordinator;
use crate::tracker::LivenessTracker;

#[derive(Clone)]
pub struct AppState {
    pub assets: Arc<AssetService>,
    pub groups: Arc<GroupService>,
    pub software: Arc<dyn SoftwareRepository>,
    pub tracker: Arc<dyn LivenessTracker>,
    pub pipeline: Option<Arc<PipelineCoordinator>>,
    /// Producer behind the development ingest route; absent when the
    /// deployment only runs the admin surface.
    pub publisher: Option<Arc<dyn BusProducer>>,
    pub raw_topic: String,
    pub pg_pool: PgPool,
}
