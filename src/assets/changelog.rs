//! Append-only per-field audit trail for assets.

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ChangeLogEntry, ChangeLogQuery, ChangeSource, Page};

/// Canonical field names written to the audit trail. Services never pass
/// free-form names, which keeps history stable across schema changes.
pub mod fields {
    pub const STATUS: &str = "status";
    pub const HOSTNAME: &str = "hostname";
    pub const OS_VERSION: &str = "os_version";
    pub const IP_ADDRESSES: &str = "ip_addresses";
    pub const MAC_ADDRESSES: &str = "mac_addresses";
    pub const AGENT_VERSION: &str = "agent_version";
    pub const ARCHITECTURE: &str = "architecture";
}

/// One pending change for a batched write.
#[derive(Debug, Clone)]
pub struct FieldChange {
    pub field_name: String,
    pub old_value: String,
    pub new_value: String,
}

impl FieldChange {
    pub fn new(field: &str, old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            field_name: field.to_string(),
            old_value: old.into(),
            new_value: new.into(),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    async fn log(
        &self,
        asset_id: Uuid,
        field_name: &str,
        old_value: &str,
        new_value: &str,
        source: ChangeSource,
    ) -> Result<()>;

    /// Insert a batch of changes sharing one `changed_at` stamp.
    async fn log_multi(
        &self,
        asset_id: Uuid,
        changes: &[FieldChange],
        source: ChangeSource,
    ) -> Result<()>;

    /// Page through an asset's history, newest first.
    async fn history(&self, asset_id: Uuid, query: ChangeLogQuery) -> Result<Page<ChangeLogEntry>>;
}

pub struct PgChangeLog {
    pool: PgPool,
}

impl PgChangeLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeLogStore for PgChangeLog {
    async fn log(
        &self,
        asset_id: Uuid,
        field_name: &str,
        old_value: &str,
        new_value: &str,
        source: ChangeSource,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO asset_change_logs (id, asset_id, field_name, old_value, new_value, changed_by, changed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(asset_id)
        .bind(field_name)
        .bind(old_value)
        .bind(new_value)
        .bind(source)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_multi(
        &self,
        asset_id: Uuid,
        changes: &[FieldChange],
        source: ChangeSource,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let changed_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        for change in changes {
            sqlx::query(
                "INSERT INTO asset_change_logs (id, asset_id, field_name, old_value, new_value, changed_by, changed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(Uuid::new_v4())
            .bind(asset_id)
            .bind(&change.field_name)
            .bind(&change.old_value)
            .bind(&change.new_value)
            .bind(source)
            .bind(changed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, asset_id: Uuid, query: ChangeLogQuery) -> Result<Page<ChangeLogEntry>> {
        let (page, page_size) = crate::models::normalize_pagination(query.page, query.page_size);

        let push_filters = |builder: &mut QueryBuilder<Postgres>| {
            builder.push(" WHERE asset_id = ").push_bind(asset_id);
            if let Some(field) = query.field.clone().filter(|f| !f.is_empty()) {
                builder.push(" AND field_name = ").push_bind(field);
            }
            if let Some(from) = query.from {
                builder.push(" AND changed_at >= ").push_bind(from);
            }
            if let Some(to) = query.to {
                builder.push(" AND changed_at <= ").push_bind(to);
            }
        };

        let mut count_builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM asset_change_logs");
        push_filters(&mut count_builder);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, asset_id, field_name, old_value, new_value, changed_by, changed_at \
             FROM asset_change_logs",
        );
        push_filters(&mut builder);
        builder.push(" ORDER BY changed_at DESC");
        builder.push(" LIMIT ").push_bind(page_size as i64);
        builder
            .push(" OFFSET ")
            .push_bind((page as i64 - 1) * page_size as i64);

        let items = builder
            .build_query_as::<ChangeLogEntry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Page::new(items, total, page, page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_change_builder_keeps_values_verbatim() {
        let change = FieldChange::new(fields::HOSTNAME, "old-host", "new-host");
        assert_eq!(change.field_name, "hostname");
        assert_eq!(change.old_value, "old-host");
        assert_eq!(change.new_value, "new-host");
    }
}
