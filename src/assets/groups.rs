//! Hierarchical asset groups with materialized paths.
//!
//! A group's `path` is `/<ancestor ids>/<self id>/` and is appended once at
//! creation. Because a new group's id is freshly minted it can never appear
//! in an existing path, so the construction is cycle-free without any
//! explicit check.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::assets::repository::AssetRepository;
use crate::error::{CoreError, Result};
use crate::models::{
    AssetGroup, CreateGroupRequest, GroupTreeNode, GroupType, UpdateGroupRequest,
};

/// Maximum depth of the hierarchy; levels are 0-based, so the deepest
/// allowed level is `MAX_GROUP_DEPTH - 1`.
pub const MAX_GROUP_DEPTH: usize = 5;

pub const MAX_GROUP_NAME_LEN: usize = 128;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn insert(&self, group: AssetGroup) -> Result<AssetGroup>;

    /// Second step of creation: persist the computed materialized path.
    async fn set_path(&self, id: Uuid, path: &str) -> Result<()>;

    async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> Result<AssetGroup>;

    async fn find_sibling_by_name(
        &self,
        tenant_id: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<AssetGroup>>;

    async fn update_name_description(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<AssetGroup>;

    async fn has_children(&self, tenant_id: Uuid, id: Uuid) -> Result<bool>;

    async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;

    /// All of a tenant's groups ordered by path ascending, which places
    /// every parent before its children.
    async fn list_all(&self, tenant_id: Uuid) -> Result<Vec<AssetGroup>>;

    /// Fetch specific groups ordered by level ascending.
    async fn find_by_ids_ordered(&self, tenant_id: Uuid, ids: &[Uuid]) -> Result<Vec<AssetGroup>>;

    /// Every group whose path starts with `path_prefix`, the prefix's own
    /// group included, ordered by path.
    async fn find_descendants(&self, tenant_id: Uuid, path_prefix: &str)
        -> Result<Vec<AssetGroup>>;

    async fn add_member(&self, group_id: Uuid, asset_id: Uuid) -> Result<()>;

    async fn remove_member(&self, group_id: Uuid, asset_id: Uuid) -> Result<()>;

    async fn remove_group_memberships(&self, group_id: Uuid) -> Result<u64>;

    async fn remove_asset_memberships(&self, asset_id: Uuid) -> Result<u64>;
}

/// Parse the ancestor ids out of a materialized path, excluding the node
/// itself, ordered root first.
pub fn parse_ancestor_ids(path: &str) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();
    ids.pop();
    ids
}

pub struct GroupService {
    groups: Arc<dyn GroupRepository>,
    assets: Arc<dyn AssetRepository>,
}

impl GroupService {
    pub fn new(groups: Arc<dyn GroupRepository>, assets: Arc<dyn AssetRepository>) -> Self {
        Self { groups, assets }
    }

    pub async fn create(&self, tenant_id: Uuid, request: CreateGroupRequest) -> Result<AssetGroup> {
        let name = request.name.trim().to_string();
        if name.is_empty() || name.len() > MAX_GROUP_NAME_LEN {
            return Err(CoreError::invalid_request(format!(
                "group name must be between 1 and {MAX_GROUP_NAME_LEN} characters"
            )));
        }
        let group_type = match request.group_type.as_deref() {
            None | Some("custom") => GroupType::Custom,
            Some("department") => GroupType::Department,
            Some("location") => GroupType::Location,
            Some(other) => {
                return Err(CoreError::invalid_request(format!("unknown group type: {other}")))
            }
        };

        let parent = match request.parent_id {
            None => None,
            Some(parent_id) => Some(self.groups.find_by_id(tenant_id, parent_id).await?),
        };
        if let Some(parent) = &parent {
            if parent.level as usize >= MAX_GROUP_DEPTH - 1 {
                return Err(CoreError::GroupDepthExceeded(MAX_GROUP_DEPTH));
            }
        }

        if self
            .groups
            .find_sibling_by_name(tenant_id, request.parent_id, &name)
            .await?
            .is_some()
        {
            return Err(CoreError::DuplicateGroupName(name));
        }

        let now = Utc::now();
        let group = AssetGroup {
            id: Uuid::new_v4(),
            tenant_id,
            name,
            description: request.description.unwrap_or_default(),
            group_type,
            parent_id: parent.as_ref().map(|p| p.id),
            path: String::new(),
            level: parent.as_ref().map(|p| p.level + 1).unwrap_or(0),
            created_at: now,
            updated_at: now,
        };

        let mut created = self.groups.insert(group).await?;
        let path = match &parent {
            Some(parent) => format!("{}{}/", parent.path, created.id),
            None => format!("/{}/", created.id),
        };
        self.groups.set_path(created.id, &path).await?;
        created.path = path;
        Ok(created)
    }

    pub async fn update(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: UpdateGroupRequest,
    ) -> Result<AssetGroup> {
        let existing = self.groups.find_by_id(tenant_id, id).await?;

        let name = match patch.name {
            Some(name) => {
                let name = name.trim().to_string();
                if name.is_empty() || name.len() > MAX_GROUP_NAME_LEN {
                    return Err(CoreError::invalid_request(format!(
                        "group name must be between 1 and {MAX_GROUP_NAME_LEN} characters"
                    )));
                }
                if name != existing.name {
                    if let Some(sibling) = self
                        .groups
                        .find_sibling_by_name(tenant_id, existing.parent_id, &name)
                        .await?
                    {
                        if sibling.id != id {
                            return Err(CoreError::DuplicateGroupName(name));
                        }
                    }
                }
                name
            }
            None => existing.name.clone(),
        };
        let description = patch.description.unwrap_or_else(|| existing.description.clone());

        self.groups
            .update_name_description(tenant_id, id, &name, &description)
            .await
    }

    /// Delete an empty group; member rows go with it.
    pub async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let group = self.groups.find_by_id(tenant_id, id).await?;
        if self.groups.has_children(tenant_id, group.id).await? {
            return Err(CoreError::GroupHasChildren(group.name));
        }
        self.groups.remove_group_memberships(group.id).await?;
        self.groups.delete(tenant_id, group.id).await
    }

    pub async fn assign(&self, tenant_id: Uuid, group_id: Uuid, asset_id: Uuid) -> Result<()> {
        let group = self.groups.find_by_id(tenant_id, group_id).await?;
        let asset = self.assets.find_by_id(tenant_id, asset_id).await?;
        self.groups.add_member(group.id, asset.id).await
    }

    pub async fn remove(&self, tenant_id: Uuid, group_id: Uuid, asset_id: Uuid) -> Result<()> {
        let group = self.groups.find_by_id(tenant_id, group_id).await?;
        self.groups.remove_member(group.id, asset_id).await
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<AssetGroup> {
        self.groups.find_by_id(tenant_id, id).await
    }

    /// Build the tenant's group forest. Children arrays hold only direct
    /// descendants; sibling order follows path order.
    pub async fn tree(&self, tenant_id: Uuid) -> Result<Vec<GroupTreeNode>> {
        let groups = self.groups.list_all(tenant_id).await?;
        Ok(build_forest(groups))
    }

    /// A group's subtree (itself included), discovered through its
    /// materialized path prefix.
    pub async fn descendants(&self, tenant_id: Uuid, id: Uuid) -> Result<Vec<AssetGroup>> {
        let group = self.groups.find_by_id(tenant_id, id).await?;
        self.groups.find_descendants(tenant_id, &group.path).await
    }

    /// A group's ancestor chain, root first.
    pub async fn ancestors(&self, tenant_id: Uuid, id: Uuid) -> Result<Vec<AssetGroup>> {
        let group = self.groups.find_by_id(tenant_id, id).await?;
        let ids = parse_ancestor_ids(&group.path);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.groups.find_by_ids_ordered(tenant_id, &ids).await
    }
}

fn build_forest(groups: Vec<AssetGroup>) -> Vec<GroupTreeNode> {
    let known: std::collections::HashSet<Uuid> = groups.iter().map(|g| g.id).collect();
    let mut children: HashMap<Uuid, Vec<AssetGroup>> = HashMap::new();
    let mut roots: Vec<AssetGroup> = Vec::new();

    for group in groups {
        match group.parent_id {
            Some(parent_id) if known.contains(&parent_id) => {
                children.entry(parent_id).or_default().push(group);
            }
            _ => roots.push(group),
        }
    }

    fn attach(group: AssetGroup, children: &mut HashMap<Uuid, Vec<AssetGroup>>) -> GroupTreeNode {
        let direct = children.remove(&group.id).unwrap_or_default();
        GroupTreeNode {
            group,
            children: direct.into_iter().map(|c| attach(c, children)).collect(),
        }
    }

    roots.into_iter().map(|g| attach(g, &mut children)).collect()
}

pub struct PgGroupRepository {
    pool: PgPool,
}

impl PgGroupRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const GROUP_COLUMNS: &str =
    "id, tenant_id, name, description, group_type, parent_id, path, level, created_at, updated_at";

#[async_trait]
impl GroupRepository for PgGroupRepository {
    async fn insert(&self, group: AssetGroup) -> Result<AssetGroup> {
        let inserted = sqlx::query_as::<_, AssetGroup>(&format!(
            "INSERT INTO asset_groups ({GROUP_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {GROUP_COLUMNS}"
        ))
        .bind(group.id)
        .bind(group.tenant_id)
        .bind(&group.name)
        .bind(&group.description)
        .bind(group.group_type)
        .bind(group.parent_id)
        .bind(&group.path)
        .bind(group.level)
        .bind(group.created_at)
        .bind(group.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.code().as_deref() == Some("23505") {
                    return CoreError::DuplicateGroupName(group.name.clone());
                }
            }
            e.into()
        })?;
        Ok(inserted)
    }

    async fn set_path(&self, id: Uuid, path: &str) -> Result<()> {
        sqlx::query("UPDATE asset_groups SET path = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> Result<AssetGroup> {
        sqlx::query_as::<_, AssetGroup>(&format!(
            "SELECT {GROUP_COLUMNS} FROM asset_groups WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::GroupNotFound(id.to_string()))
    }

    async fn find_sibling_by_name(
        &self,
        tenant_id: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<AssetGroup>> {
        let group = sqlx::query_as::<_, AssetGroup>(&format!(
            "SELECT {GROUP_COLUMNS} FROM asset_groups \
             WHERE tenant_id = $1 AND parent_id IS NOT DISTINCT FROM $2 AND name = $3"
        ))
        .bind(tenant_id)
        .bind(parent_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(group)
    }

    async fn update_name_description(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<AssetGroup> {
        sqlx::query_as::<_, AssetGroup>(&format!(
            "UPDATE asset_groups SET name = $3, description = $4, updated_at = now() \
             WHERE tenant_id = $1 AND id = $2 \
             RETURNING {GROUP_COLUMNS}"
        ))
        .bind(tenant_id)
        .bind(id)
        .bind(name)
        .bind(description)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::GroupNotFound(id.to_string()))
    }

    async fn has_children(&self, tenant_id: Uuid, id: Uuid) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM asset_groups WHERE tenant_id = $1 AND parent_id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM asset_groups WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::GroupNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_all(&self, tenant_id: Uuid) -> Result<Vec<AssetGroup>> {
        let groups = sqlx::query_as::<_, AssetGroup>(&format!(
            "SELECT {GROUP_COLUMNS} FROM asset_groups WHERE tenant_id = $1 ORDER BY path ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }

    async fn find_by_ids_ordered(&self, tenant_id: Uuid, ids: &[Uuid]) -> Result<Vec<AssetGroup>> {
        let groups = sqlx::query_as::<_, AssetGroup>(&format!(
            "SELECT {GROUP_COLUMNS} FROM asset_groups \
             WHERE tenant_id = $1 AND id = ANY($2) ORDER BY level ASC"
        ))
        .bind(tenant_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }

    async fn find_descendants(
        &self,
        tenant_id: Uuid,
        path_prefix: &str,
    ) -> Result<Vec<AssetGroup>> {
        let groups = sqlx::query_as::<_, AssetGroup>(&format!(
            "SELECT {GROUP_COLUMNS} FROM asset_groups \
             WHERE tenant_id = $1 AND path LIKE $2 ORDER BY path ASC"
        ))
        .bind(tenant_id)
        .bind(format!("{path_prefix}%"))
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }

    async fn add_member(&self, group_id: Uuid, asset_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO asset_group_members (group_id, asset_id, joined_at) VALUES ($1, $2, $3)",
        )
        .bind(group_id)
        .bind(asset_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.code().as_deref() == Some("23505") {
                    return CoreError::AssetAlreadyInGroup;
                }
            }
            e.into()
        })?;
        Ok(())
    }

    async fn remove_member(&self, group_id: Uuid, asset_id: Uuid) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM asset_group_members WHERE group_id = $1 AND asset_id = $2")
                .bind(group_id)
                .bind(asset_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::AssetNotInGroup);
        }
        Ok(())
    }

    async fn remove_group_memberships(&self, group_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM asset_group_members WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_asset_memberships(&self, asset_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM asset_group_members WHERE asset_id = $1")
            .bind(asset_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
