//! Request/response DTOs for the admin surface and the heartbeat ingress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::asset::AssetGroup;

pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Agent registration / heartbeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAssetRequest {
    pub agent_id: String,
    pub tenant_id: String,
    pub hostname: String,
    pub os_type: String,
    pub os_version: String,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
    pub agent_version: String,
}

/// Administrative partial update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAssetRequest {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub ip_addresses: Option<Vec<String>>,
    #[serde(default)]
    pub mac_addresses: Option<Vec<String>>,
    #[serde(default)]
    pub agent_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetListQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: Option<String>,
}

/// Paged response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: u32, page_size: u32) -> Self {
        let total_pages = if total <= 0 {
            0
        } else {
            ((total as u64).div_ceil(page_size as u64)) as u32
        };
        Self { items, total, page, page_size, total_pages }
    }
}

/// Clamp pagination inputs: page ≥ 1, 1 ≤ page_size ≤ 100.
pub fn normalize_pagination(page: Option<u32>, page_size: Option<u32>) -> (u32, u32) {
    let page = page.unwrap_or(1).max(1);
    let page_size = page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    (page, page_size)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub group_type: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGroupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignAssetRequest {
    pub asset_id: Uuid,
}

/// One node of the group forest returned by the tree endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GroupTreeNode {
    #[serde(flatten)]
    pub group: AssetGroup,
    pub children: Vec<GroupTreeNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeLogQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

/// One installed-software observation as reported by the agent connector.
#[derive(Debug, Clone, Deserialize)]
pub struct SoftwareReport {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub install_path: Option<String>,
    #[serde(default)]
    pub installed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SoftwareSearchQuery {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_clamps_to_bounds() {
        assert_eq!(normalize_pagination(None, None), (1, DEFAULT_PAGE_SIZE));
        assert_eq!(normalize_pagination(Some(0), Some(0)), (1, 1));
        assert_eq!(normalize_pagination(Some(3), Some(500)), (3, 100));
    }

    #[test]
    fn total_pages_is_ceiling_division() {
        let page: Page<u8> = Page::new(vec![], 101, 1, 20);
        assert_eq!(page.total_pages, 6);
        let empty: Page<u8> = Page::new(vec![], 0, 1, 20);
        assert_eq!(empty.total_pages, 0);
    }
}
