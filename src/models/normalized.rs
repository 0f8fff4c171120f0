//! Canonical event schema emitted by the pipeline.
//!
//! The shape follows the ECS-style layout the downstream search index and
//! stream consumers expect: a common envelope plus per-kind sections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Version tag stamped on every normalized event and carried as a broker
/// header on the raw topic.
pub const SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub id: String,
    /// Always "event"; detections downstream re-tag their own documents.
    pub kind: String,
    pub module: String,
    pub provider: String,
    pub created: DateTime<Utc>,
    pub ingested: DateTime<Utc>,
    pub category: Vec<String>,
    #[serde(rename = "type")]
    pub type_: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OsInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeoSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_iso_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessSection {
    pub pid: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentProcessSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParentProcessSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HashSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileSection {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DnsQuestion {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DnsSection {
    pub question: DnsQuestion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_ip: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The canonical event written to the normalized topic and the search sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub schema_version: String,
    pub event: EventMeta,
    pub host: HostInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<EndpointSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<EndpointSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSection>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub agent: AgentInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_ecs_field_names() {
        let now = Utc::now();
        let event = NormalizedEvent {
            timestamp: now,
            schema_version: SCHEMA_VERSION.to_string(),
            event: EventMeta {
                id: "evt-1".into(),
                kind: "event".into(),
                module: "edr".into(),
                provider: "process_create".into(),
                created: now,
                ingested: now,
                category: vec!["process".into()],
                type_: vec!["start".into()],
            },
            host: HostInfo::default(),
            process: None,
            file: None,
            source: None,
            destination: None,
            dns: None,
            labels: HashMap::new(),
            tags: Vec::new(),
            agent: AgentInfo {
                id: "agent-7".into(),
                type_: "edr-agent".into(),
                version: None,
                name: None,
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("@timestamp").is_some());
        assert_eq!(value["event"]["type"][0], "start");
        assert_eq!(value["agent"]["type"], "edr-agent");
        // Empty optional sections stay off the wire.
        assert!(value.get("process").is_none());
        assert!(value.get("labels").is_none());
    }
}
