//! Durable asset-inventory domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "asset_status", rename_all = "lowercase")]
pub enum AssetStatus {
    Unknown,
    Online,
    Offline,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Unknown => "unknown",
            AssetStatus::Online => "online",
            AssetStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(AssetStatus::Unknown),
            "online" => Ok(AssetStatus::Online),
            "offline" => Ok(AssetStatus::Offline),
            other => Err(CoreError::invalid_request(format!("unknown status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "os_type", rename_all = "lowercase")]
pub enum OsType {
    Windows,
    Linux,
    Macos,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Windows => "windows",
            OsType::Linux => "linux",
            OsType::Macos => "macos",
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(OsType::Windows),
            "linux" => Ok(OsType::Linux),
            "macos" | "darwin" => Ok(OsType::Macos),
            other => Err(CoreError::invalid_request(format!("unknown os type: {other}"))),
        }
    }
}

/// A managed endpoint. `(tenant_id, agent_id)` is unique among rows whose
/// `deleted_at` is null.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub agent_id: String,
    pub hostname: String,
    pub os_type: OsType,
    pub os_version: String,
    pub architecture: String,
    pub ip_addresses: Vec<String>,
    pub mac_addresses: Vec<String>,
    pub agent_version: String,
    pub status: AssetStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing, default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Asset {
    /// Canonical string rendering used when diffing and change-logging the
    /// ordered IP sequence.
    pub fn joined_ips(&self) -> String {
        self.ip_addresses.join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "change_source", rename_all = "lowercase")]
pub enum ChangeSource {
    System,
    Agent,
    Api,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::System => "system",
            ChangeSource::Agent => "agent",
            ChangeSource::Api => "api",
        }
    }
}

/// One append-only audit row for a monitored-field change.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChangeLogEntry {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub field_name: String,
    pub old_value: String,
    pub new_value: String,
    pub changed_by: ChangeSource,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "group_type", rename_all = "lowercase")]
pub enum GroupType {
    Department,
    Location,
    Custom,
}

/// Hierarchical asset group. `path` encodes the full ancestor chain by id,
/// always wrapped in `/`; `level` is 0-based depth.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssetGroup {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: String,
    pub group_type: GroupType,
    pub parent_id: Option<Uuid>,
    pub path: String,
    pub level: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub asset_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

/// One installed-software observation reported for an asset.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SoftwareRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub asset_id: Uuid,
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub install_path: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Liveness record held in the KV store under `agent:status:{agent_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OnlineRecord {
    pub agent_id: String,
    pub tenant_id: String,
    pub status: String,
    pub last_heartbeat: i64,
    pub hostname: String,
    pub ip: String,
    pub agent_version: String,
    pub os_family: String,
    pub connected_server: String,
}

/// Heartbeat metadata forwarded to the online-state tracker.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatInfo {
    pub hostname: String,
    pub ip: String,
    pub agent_version: String,
    pub os_family: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_type_parsing_accepts_darwin_alias() {
        assert_eq!("macos".parse::<OsType>().unwrap(), OsType::Macos);
        assert_eq!("Darwin".parse::<OsType>().unwrap(), OsType::Macos);
        assert!("beos".parse::<OsType>().is_err());
    }

    #[test]
    fn joined_ips_preserves_order() {
        let mut asset = sample_asset();
        asset.ip_addresses = vec!["10.0.0.2".into(), "192.168.1.5".into()];
        assert_eq!(asset.joined_ips(), "10.0.0.2,192.168.1.5");
    }

    pub(crate) fn sample_asset() -> Asset {
        let now = Utc::now();
        Asset {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            agent_id: "agent-1".into(),
            hostname: "host-1".into(),
            os_type: OsType::Linux,
            os_version: "Ubuntu 22.04".into(),
            architecture: "x86_64".into(),
            ip_addresses: vec!["192.168.1.100".into()],
            mac_addresses: vec!["00:11:22:33:44:55".into()],
            agent_version: "1.0.0".into(),
            status: AssetStatus::Online,
            last_seen_at: Some(now),
            first_seen_at: now,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
