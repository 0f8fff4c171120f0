//! Software inventory reads.

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Page, SoftwareRecord, SoftwareReport};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SoftwareRepository: Send + Sync {
    async fn list_by_asset(
        &self,
        tenant_id: Uuid,
        asset_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<Page<SoftwareRecord>>;

    /// Case-insensitive substring search over name and publisher.
    async fn search(
        &self,
        tenant_id: Uuid,
        name: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<SoftwareRecord>>;

    /// Swap an asset's inventory for the freshly reported set, in one
    /// transaction.
    async fn replace_for_asset(
        &self,
        tenant_id: Uuid,
        asset_id: Uuid,
        items: &[SoftwareReport],
    ) -> Result<u64>;
}

const SOFTWARE_COLUMNS: &str =
    "id, tenant_id, asset_id, name, version, publisher, install_path, installed_at, created_at";

pub struct PgSoftwareRepository {
    pool: PgPool,
}

impl PgSoftwareRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SoftwareRepository for PgSoftwareRepository {
    async fn list_by_asset(
        &self,
        tenant_id: Uuid,
        asset_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<Page<SoftwareRecord>> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM software_inventory WHERE tenant_id = $1 AND asset_id = $2",
        )
        .bind(tenant_id)
        .bind(asset_id)
        .fetch_one(&self.pool)
        .await?;

        let items = sqlx::query_as::<_, SoftwareRecord>(&format!(
            "SELECT {SOFTWARE_COLUMNS} FROM software_inventory \
             WHERE tenant_id = $1 AND asset_id = $2 \
             ORDER BY name ASC LIMIT $3 OFFSET $4"
        ))
        .bind(tenant_id)
        .bind(asset_id)
        .bind(page_size as i64)
        .bind((page as i64 - 1) * page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page::new(items, total, page, page_size))
    }

    async fn search(
        &self,
        tenant_id: Uuid,
        name: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<SoftwareRecord>> {
        // LOWER(...) LIKE pins case-insensitive matching in SQL instead of
        // leaning on column collation.
        let pattern = format!("%{}%", name.to_lowercase());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM software_inventory \
             WHERE tenant_id = $1 AND (LOWER(name) LIKE $2 OR LOWER(publisher) LIKE $2)",
        )
        .bind(tenant_id)
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let items = sqlx::query_as::<_, SoftwareRecord>(&format!(
            "SELECT {SOFTWARE_COLUMNS} FROM software_inventory \
             WHERE tenant_id = $1 AND (LOWER(name) LIKE $2 OR LOWER(publisher) LIKE $2) \
             ORDER BY name ASC LIMIT $3 OFFSET $4"
        ))
        .bind(tenant_id)
        .bind(&pattern)
        .bind(page_size as i64)
        .bind((page as i64 - 1) * page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page::new(items, total, page, page_size))
    }

    async fn replace_for_asset(
        &self,
        tenant_id: Uuid,
        asset_id: Uuid,
        items: &[SoftwareReport],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM software_inventory WHERE tenant_id = $1 AND asset_id = $2")
            .bind(tenant_id)
            .bind(asset_id)
            .execute(&mut *tx)
            .await?;

        let created_at = Utc::now();
        for item in items {
            sqlx::query(
                "INSERT INTO software_inventory \
                 (id, tenant_id, asset_id, name, version, publisher, install_path, installed_at, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(Uuid::new_v4())
            .bind(tenant_id)
            .bind(asset_id)
            .bind(&item.name)
            .bind(&item.version)
            .bind(&item.publisher)
            .bind(&item.install_path)
            .bind(item.installed_at)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(items.len() as u64)
    }
}
