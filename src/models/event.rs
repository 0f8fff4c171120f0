//! Raw telemetry events as produced by endpoint agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CoreError, Result};

/// Event kinds the pipeline understands. The set is closed: anything an
/// agent sends outside of it deserializes as `Unknown` and is rejected at
/// normalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProcessCreate,
    ProcessTerminate,
    FileCreate,
    FileModify,
    FileDelete,
    NetworkConnect,
    NetworkDisconnect,
    DnsQuery,
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProcessCreate => "process_create",
            EventKind::ProcessTerminate => "process_terminate",
            EventKind::FileCreate => "file_create",
            EventKind::FileModify => "file_modify",
            EventKind::FileDelete => "file_delete",
            EventKind::NetworkConnect => "network_connect",
            EventKind::NetworkDisconnect => "network_disconnect",
            EventKind::DnsQuery => "dns_query",
            EventKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessPayload {
    pub pid: u32,
    #[serde(default)]
    pub ppid: Option<u32>,
    pub name: String,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub command_line: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub parent_name: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FilePayload {
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub old_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkPayload {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    pub source_ip: String,
    #[serde(default)]
    pub source_port: Option<u16>,
    pub destination_ip: String,
    #[serde(default)]
    pub destination_port: Option<u16>,
    #[serde(default)]
    pub bytes_sent: Option<u64>,
    #[serde(default)]
    pub bytes_received: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DnsPayload {
    pub query_name: String,
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub response_code: Option<String>,
    #[serde(default)]
    pub resolved_ips: Vec<String>,
}

/// Geo lookup result attached by the geoip enricher.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeoContext {
    pub country_iso_code: Option<String>,
    pub country_name: Option<String>,
    pub city_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Registry lookup result attached by the asset enricher.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssetContext {
    pub hostname: String,
    pub os_family: String,
    pub os_version: String,
    pub department: Option<String>,
    pub labels: HashMap<String, String>,
    pub tags: Vec<String>,
}

/// Registry lookup result attached by the agent enricher.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentContext {
    pub version: String,
    pub hostname: String,
}

/// Side-bag the enricher chain fills in place. Never serialized back to the
/// wire; the normalizer folds it into the canonical event.
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub geo: Option<GeoContext>,
    pub asset: Option<AssetContext>,
    pub agent: Option<AgentContext>,
}

/// A single raw event from an agent, as decoded off the incoming topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: String,
    pub agent_id: String,
    pub tenant_id: String,
    /// Wall-clock event time, nanoseconds since the UNIX epoch, UTC.
    pub timestamp_ns: i64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FilePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsPayload>,
    #[serde(skip, default)]
    pub enrichment: Enrichment,
}

impl RawEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        let secs = self.timestamp_ns.div_euclid(1_000_000_000);
        let nanos = self.timestamp_ns.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now)
    }
}

/// Decode a raw broker payload. Failures here are terminal for the message:
/// the pipeline envelopes it to the DLQ and commits the offset.
pub fn parse_raw(payload: &[u8]) -> Result<RawEvent> {
    let event: RawEvent = serde_json::from_slice(payload)?;
    if event.event_id.is_empty() || event.agent_id.is_empty() || event.tenant_id.is_empty() {
        return Err(CoreError::invalid_request(
            "event_id, agent_id and tenant_id are required",
        ));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        serde_json::json!({
            "event_id": "evt-1",
            "agent_id": "agent-7",
            "tenant_id": "11111111-2222-3333-4444-555555555555",
            "timestamp_ns": 1_700_000_000_000_000_000i64,
            "kind": "process_create",
            "process": {"pid": 4242, "name": "bash", "command_line": "bash -c ls"}
        })
        .to_string()
    }

    #[test]
    fn parses_a_process_event() {
        let event = parse_raw(sample_json().as_bytes()).unwrap();
        assert_eq!(event.kind, EventKind::ProcessCreate);
        assert_eq!(event.process.as_ref().unwrap().pid, 4242);
        assert_eq!(event.timestamp().timestamp(), 1_700_000_000);
    }

    #[test]
    fn unknown_kind_round_trips_as_unknown() {
        let body = sample_json().replace("process_create", "registry_write");
        let event = parse_raw(body.as_bytes()).unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
    }

    #[test]
    fn rejects_missing_identity() {
        let body = sample_json().replace("agent-7", "");
        assert!(parse_raw(body.as_bytes()).is_err());
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(parse_raw(b"invalid json").is_err());
    }
}
