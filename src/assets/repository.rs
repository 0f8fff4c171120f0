//! Tenant-scoped asset persistence over PostgreSQL.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{Asset, AssetListQuery, AssetStatus, OsType, Page};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    LastSeenAt,
    Hostname,
    CreatedAt,
    FirstSeenAt,
    OsType,
}

impl SortKey {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(SortKey::LastSeenAt),
            Some("last_seen_at") => Ok(SortKey::LastSeenAt),
            Some("hostname") => Ok(SortKey::Hostname),
            Some("created_at") => Ok(SortKey::CreatedAt),
            Some("first_seen_at") => Ok(SortKey::FirstSeenAt),
            Some("os_type") => Ok(SortKey::OsType),
            Some(other) => Err(CoreError::invalid_request(format!("unknown sort key: {other}"))),
        }
    }

    fn column(&self) -> &'static str {
        match self {
            SortKey::LastSeenAt => "last_seen_at",
            SortKey::Hostname => "hostname",
            SortKey::CreatedAt => "created_at",
            SortKey::FirstSeenAt => "first_seen_at",
            SortKey::OsType => "os_type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(SortOrder::Desc),
            Some("asc") => Ok(SortOrder::Asc),
            Some("desc") => Ok(SortOrder::Desc),
            Some(other) => Err(CoreError::invalid_request(format!("unknown sort order: {other}"))),
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListAssetsOptions {
    pub page: u32,
    pub page_size: u32,
    pub status: Option<AssetStatus>,
    pub os_type: Option<OsType>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub group_id: Option<Uuid>,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
}

impl ListAssetsOptions {
    /// Validate and clamp a query-string request. Unknown sort keys,
    /// orders, statuses and os types are rejected rather than ignored.
    pub fn from_query(query: &AssetListQuery) -> Result<Self> {
        let (page, page_size) = crate::models::normalize_pagination(query.page, query.page_size);
        Ok(Self {
            page,
            page_size,
            status: query.status.as_deref().map(str::parse).transpose()?,
            os_type: query.os_type.as_deref().map(str::parse).transpose()?,
            hostname: query.hostname.clone().filter(|s| !s.is_empty()),
            ip: query.ip.clone().filter(|s| !s.is_empty()),
            group_id: query.group_id,
            sort_by: SortKey::parse(query.sort_by.as_deref())?,
            sort_order: SortOrder::parse(query.sort_order.as_deref())?,
        })
    }

    fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.page_size as i64
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AssetRepository: Send + Sync {
    /// Insert a new asset. A nil id is replaced, create/update/first-seen
    /// stamps are set, and a missing status defaults to unknown.
    async fn create(&self, asset: Asset) -> Result<Asset>;

    async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> Result<Asset>;

    async fn find_by_agent_id(&self, tenant_id: Uuid, agent_id: &str) -> Result<Asset>;

    async fn find_all(&self, tenant_id: Uuid, opts: ListAssetsOptions) -> Result<Page<Asset>>;

    /// Full update of the mutable columns.
    async fn update(&self, asset: &Asset) -> Result<Asset>;

    async fn update_status(&self, tenant_id: Uuid, id: Uuid, status: AssetStatus) -> Result<()>;

    async fn batch_update_status(&self, ids: &[Uuid], status: AssetStatus) -> Result<u64>;

    async fn update_status_by_agent_id(
        &self,
        tenant_id: Uuid,
        agent_id: &str,
        status: AssetStatus,
    ) -> Result<()>;

    /// Atomically stamp `last_seen_at` and force status online.
    async fn update_last_seen(
        &self,
        tenant_id: Uuid,
        agent_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn soft_delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;

    async fn count_by_status(&self, tenant_id: Uuid) -> Result<HashMap<AssetStatus, i64>>;

    /// Cross-tenant read used only by the status reconciler.
    async fn get_all_online_assets(&self) -> Result<Vec<Asset>>;
}

const ASSET_COLUMNS: &str = "id, tenant_id, agent_id, hostname, os_type, os_version, architecture, \
     ip_addresses, mac_addresses, agent_version, status, last_seen_at, first_seen_at, \
     created_at, updated_at, deleted_at";

pub struct PgAssetRepository {
    pool: PgPool,
}

impl PgAssetRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_unique_violation(e: sqlx::Error, agent_id: &str) -> CoreError {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some("23505") {
                return CoreError::DuplicateAsset(agent_id.to_string());
            }
        }
        e.into()
    }

    fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, tenant_id: Uuid, opts: &'a ListAssetsOptions) {
        builder.push(" WHERE tenant_id = ").push_bind(tenant_id);
        builder.push(" AND deleted_at IS NULL");
        if let Some(status) = opts.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(os_type) = opts.os_type {
            builder.push(" AND os_type = ").push_bind(os_type);
        }
        if let Some(hostname) = &opts.hostname {
            builder
                .push(" AND hostname ILIKE ")
                .push_bind(format!("%{hostname}%"));
        }
        if let Some(ip) = &opts.ip {
            builder
                .push(" AND array_to_string(ip_addresses, ',') LIKE ")
                .push_bind(format!("%{ip}%"));
        }
        if let Some(group_id) = opts.group_id {
            builder
                .push(" AND id IN (SELECT asset_id FROM asset_group_members WHERE group_id = ")
                .push_bind(group_id)
                .push(")");
        }
    }
}

#[async_trait]
impl AssetRepository for PgAssetRepository {
    async fn create(&self, mut asset: Asset) -> Result<Asset> {
        let now = Utc::now();
        if asset.id.is_nil() {
            asset.id = Uuid::new_v4();
        }
        asset.created_at = now;
        asset.updated_at = now;
        if asset.first_seen_at.timestamp() == 0 {
            asset.first_seen_at = now;
        }

        if asset.agent_id.is_empty() || asset.agent_id.len() > 64 {
            return Err(CoreError::invalid_request(
                "agent_id must be between 1 and 64 characters",
            ));
        }

        let created = sqlx::query_as::<_, Asset>(&format!(
            "INSERT INTO assets ({ASSET_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             RETURNING {ASSET_COLUMNS}"
        ))
        .bind(asset.id)
        .bind(asset.tenant_id)
        .bind(&asset.agent_id)
        .bind(&asset.hostname)
        .bind(asset.os_type)
        .bind(&asset.os_version)
        .bind(&asset.architecture)
        .bind(&asset.ip_addresses)
        .bind(&asset.mac_addresses)
        .bind(&asset.agent_version)
        .bind(asset.status)
        .bind(asset.last_seen_at)
        .bind(asset.first_seen_at)
        .bind(asset.created_at)
        .bind(asset.updated_at)
        .bind(asset.deleted_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::map_unique_violation(e, &asset.agent_id))?;

        Ok(created)
    }

    async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> Result<Asset> {
        sqlx::query_as::<_, Asset>(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets \
             WHERE tenant_id = $1 AND id = $2 AND deleted_at IS NULL"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::AssetNotFound(id.to_string()))
    }

    async fn find_by_agent_id(&self, tenant_id: Uuid, agent_id: &str) -> Result<Asset> {
        sqlx::query_as::<_, Asset>(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets \
             WHERE tenant_id = $1 AND agent_id = $2 AND deleted_at IS NULL"
        ))
        .bind(tenant_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::AssetNotFound(agent_id.to_string()))
    }

    async fn find_all(&self, tenant_id: Uuid, opts: ListAssetsOptions) -> Result<Page<Asset>> {
        let mut count_builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM assets");
        Self::push_filters(&mut count_builder, tenant_id, &opts);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {ASSET_COLUMNS} FROM assets"));
        Self::push_filters(&mut builder, tenant_id, &opts);
        builder.push(format!(
            " ORDER BY {} {}",
            opts.sort_by.column(),
            opts.sort_order.keyword()
        ));
        if opts.sort_by == SortKey::LastSeenAt {
            builder.push(" NULLS LAST");
        }
        builder.push(" LIMIT ").push_bind(opts.page_size as i64);
        builder.push(" OFFSET ").push_bind(opts.offset());

        let items = builder
            .build_query_as::<Asset>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Page::new(items, total, opts.page, opts.page_size))
    }

    async fn update(&self, asset: &Asset) -> Result<Asset> {
        sqlx::query_as::<_, Asset>(&format!(
            "UPDATE assets SET hostname = $3, os_type = $4, os_version = $5, architecture = $6, \
             ip_addresses = $7, mac_addresses = $8, agent_version = $9, status = $10, \
             last_seen_at = $11, updated_at = now() \
             WHERE tenant_id = $1 AND id = $2 AND deleted_at IS NULL \
             RETURNING {ASSET_COLUMNS}"
        ))
        .bind(asset.tenant_id)
        .bind(asset.id)
        .bind(&asset.hostname)
        .bind(asset.os_type)
        .bind(&asset.os_version)
        .bind(&asset.architecture)
        .bind(&asset.ip_addresses)
        .bind(&asset.mac_addresses)
        .bind(&asset.agent_version)
        .bind(asset.status)
        .bind(asset.last_seen_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::AssetNotFound(asset.id.to_string()))
    }

    async fn update_status(&self, tenant_id: Uuid, id: Uuid, status: AssetStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE assets SET status = $3, updated_at = now() \
             WHERE tenant_id = $1 AND id = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AssetNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn batch_update_status(&self, ids: &[Uuid], status: AssetStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE assets SET status = $2, updated_at = now() \
             WHERE id = ANY($1) AND deleted_at IS NULL",
        )
        .bind(ids)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_status_by_agent_id(
        &self,
        tenant_id: Uuid,
        agent_id: &str,
        status: AssetStatus,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE assets SET status = $3, updated_at = now() \
             WHERE tenant_id = $1 AND agent_id = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(agent_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AssetNotFound(agent_id.to_string()));
        }
        Ok(())
    }

    async fn update_last_seen(
        &self,
        tenant_id: Uuid,
        agent_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE assets SET last_seen_at = $3, status = 'online', updated_at = now() \
             WHERE tenant_id = $1 AND agent_id = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(agent_id)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AssetNotFound(agent_id.to_string()));
        }
        Ok(())
    }

    async fn soft_delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE assets SET deleted_at = now(), updated_at = now() \
             WHERE tenant_id = $1 AND id = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::AssetNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn count_by_status(&self, tenant_id: Uuid) -> Result<HashMap<AssetStatus, i64>> {
        let rows: Vec<(AssetStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM assets \
             WHERE tenant_id = $1 AND deleted_at IS NULL GROUP BY status",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn get_all_online_assets(&self) -> Result<Vec<Asset>> {
        let assets = sqlx::query_as::<_, Asset>(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets \
             WHERE status = 'online' AND deleted_at IS NULL"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_key_parsing_rejects_unknown_keys() {
        assert_eq!(SortKey::parse(None).unwrap(), SortKey::LastSeenAt);
        assert_eq!(SortKey::parse(Some("hostname")).unwrap(), SortKey::Hostname);
        let err = SortKey::parse(Some("favourite_color")).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(SortOrder::parse(Some("sideways")).is_err());
    }

    #[test]
    fn list_options_clamp_pagination_and_validate_filters() {
        let query = AssetListQuery {
            page: Some(0),
            page_size: Some(1000),
            status: Some("online".into()),
            os_type: Some("linux".into()),
            sort_by: Some("created_at".into()),
            sort_order: Some("asc".into()),
            ..Default::default()
        };
        let opts = ListAssetsOptions::from_query(&query).unwrap();
        assert_eq!((opts.page, opts.page_size), (1, 100));
        assert_eq!(opts.status, Some(AssetStatus::Online));
        assert_eq!(opts.os_type, Some(OsType::Linux));
        assert_eq!(opts.sort_by, SortKey::CreatedAt);
        assert_eq!(opts.sort_order, SortOrder::Asc);

        let bad = AssetListQuery { status: Some("sleeping".into()), ..Default::default() };
        assert!(ListAssetsOptions::from_query(&bad).is_err());
    }
}
