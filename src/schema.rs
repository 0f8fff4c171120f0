//! Durable-store schema bootstrap.
//!
//! Inline idempotent DDL applied at startup so the binary is
//! self-contained; every statement tolerates re-runs.

use sqlx::postgres::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    // Enum types; duplicate_object means a previous run already made them.
    "DO $$ BEGIN \
        CREATE TYPE asset_status AS ENUM ('unknown', 'online', 'offline'); \
     EXCEPTION WHEN duplicate_object THEN NULL; END $$",
    "DO $$ BEGIN \
        CREATE TYPE os_type AS ENUM ('windows', 'linux', 'macos'); \
     EXCEPTION WHEN duplicate_object THEN NULL; END $$",
    "DO $$ BEGIN \
        CREATE TYPE change_source AS ENUM ('system', 'agent', 'api'); \
     EXCEPTION WHEN duplicate_object THEN NULL; END $$",
    "DO $$ BEGIN \
        CREATE TYPE group_type AS ENUM ('department', 'location', 'custom'); \
     EXCEPTION WHEN duplicate_object THEN NULL; END $$",
    "CREATE TABLE IF NOT EXISTS assets (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        agent_id VARCHAR(64) NOT NULL,
        hostname TEXT NOT NULL DEFAULT '',
        os_type os_type NOT NULL,
        os_version TEXT NOT NULL DEFAULT '',
        architecture TEXT NOT NULL DEFAULT '',
        ip_addresses TEXT[] NOT NULL DEFAULT '{}',
        mac_addresses TEXT[] NOT NULL DEFAULT '{}',
        agent_version TEXT NOT NULL DEFAULT '',
        status asset_status NOT NULL DEFAULT 'unknown',
        last_seen_at TIMESTAMPTZ,
        first_seen_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )",
    // Uniqueness holds among live rows only; soft-deleted rows keep their
    // agent_id for audit.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_assets_tenant_agent \
        ON assets (tenant_id, agent_id) WHERE deleted_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_assets_tenant_status ON assets (tenant_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_assets_hostname ON assets (hostname)",
    "CREATE INDEX IF NOT EXISTS idx_assets_last_seen_at ON assets (last_seen_at)",
    "CREATE INDEX IF NOT EXISTS idx_assets_deleted_at ON assets (deleted_at)",
    "CREATE TABLE IF NOT EXISTS asset_groups (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        name VARCHAR(128) NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        group_type group_type NOT NULL DEFAULT 'custom',
        parent_id UUID REFERENCES asset_groups(id),
        path TEXT NOT NULL DEFAULT '',
        level INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_asset_groups_path ON asset_groups (path)",
    "CREATE INDEX IF NOT EXISTS idx_asset_groups_tenant ON asset_groups (tenant_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_asset_groups_sibling_name \
        ON asset_groups (tenant_id, COALESCE(parent_id, '00000000-0000-0000-0000-000000000000'::uuid), name)",
    "CREATE TABLE IF NOT EXISTS asset_group_members (
        group_id UUID NOT NULL REFERENCES asset_groups(id),
        asset_id UUID NOT NULL,
        joined_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (group_id, asset_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_group_members_asset ON asset_group_members (asset_id)",
    "CREATE TABLE IF NOT EXISTS software_inventory (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        asset_id UUID NOT NULL,
        name TEXT NOT NULL,
        version TEXT NOT NULL DEFAULT '',
        publisher TEXT NOT NULL DEFAULT '',
        install_path TEXT,
        installed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_software_asset ON software_inventory (tenant_id, asset_id)",
    "CREATE INDEX IF NOT EXISTS idx_software_name ON software_inventory (LOWER(name))",
    "CREATE TABLE IF NOT EXISTS asset_change_logs (
        id UUID PRIMARY KEY,
        asset_id UUID NOT NULL,
        field_name TEXT NOT NULL,
        old_value TEXT NOT NULL DEFAULT '',
        new_value TEXT NOT NULL DEFAULT '',
        changed_by change_source NOT NULL,
        changed_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_change_logs_asset ON asset_change_logs (asset_id)",
    "CREATE INDEX IF NOT EXISTS idx_change_logs_changed_at ON asset_change_logs (changed_at)",
];

/// Apply the schema. Every statement is idempotent, so this runs on every
/// startup.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = STATEMENTS.len(), "schema bootstrap complete");
    Ok(())
}
