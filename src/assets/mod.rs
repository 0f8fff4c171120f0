//! Asset inventory: repository, upsert service, groups, change log and
//! software inventory.

pub mod changelog;
pub mod groups;
pub mod repository;
pub mod service;
pub mod software;

pub use repository::{AssetRepository, ListAssetsOptions, PgAssetRepository, SortKey, SortOrder};
pub use service::AssetService;
