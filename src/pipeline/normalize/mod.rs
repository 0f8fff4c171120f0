//! Kind-dispatched normalization into the canonical schema.
//!
//! The mapper for each kind is the only place event-kind-specific field
//! names appear. An unknown kind is fatal for the event and sends it to
//! the dead-letter topic.

mod dns;
mod file;
mod network;
mod process;

use chrono::Utc;

use crate::error::{CoreError, Result};
use crate::models::{
    AgentInfo, EventKind, EventMeta, GeoPoint, GeoSection, HostInfo, NormalizedEvent, OsInfo,
    RawEvent, SCHEMA_VERSION,
};

pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Map a raw event to the canonical schema and fold in whatever the
    /// enricher chain attached.
    pub fn normalize(&self, raw: &RawEvent) -> Result<NormalizedEvent> {
        let mut normalized = match raw.kind {
            EventKind::ProcessCreate | EventKind::ProcessTerminate => process::map(raw)?,
            EventKind::FileCreate | EventKind::FileModify | EventKind::FileDelete => {
                file::map(raw)?
            }
            EventKind::NetworkConnect | EventKind::NetworkDisconnect => network::map(raw)?,
            EventKind::DnsQuery => dns::map(raw)?,
            EventKind::Unknown => {
                return Err(CoreError::UnsupportedEventKind(raw.kind.as_str().to_string()))
            }
        };

        apply_enrichment(&mut normalized, raw);
        Ok(normalized)
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Common envelope shared by every mapper; sections and categorical fields
/// are the mapper's responsibility.
pub(crate) fn common_envelope(raw: &RawEvent) -> NormalizedEvent {
    let now = Utc::now();
    NormalizedEvent {
        timestamp: raw.timestamp(),
        schema_version: SCHEMA_VERSION.to_string(),
        event: EventMeta {
            id: raw.event_id.clone(),
            kind: "event".to_string(),
            module: "edr".to_string(),
            provider: raw.kind.as_str().to_string(),
            created: raw.timestamp(),
            ingested: now,
            category: Vec::new(),
            type_: Vec::new(),
        },
        host: HostInfo::default(),
        process: None,
        file: None,
        source: None,
        destination: None,
        dns: None,
        labels: Default::default(),
        tags: Vec::new(),
        agent: AgentInfo {
            id: raw.agent_id.clone(),
            type_: "edr-agent".to_string(),
            version: None,
            name: None,
        },
    }
}

fn apply_enrichment(normalized: &mut NormalizedEvent, raw: &RawEvent) {
    if let Some(geo) = raw.enrichment.geo.as_ref() {
        let section = GeoSection {
            country_iso_code: geo.country_iso_code.clone(),
            country_name: geo.country_name.clone(),
            city_name: geo.city_name.clone(),
            location: match (geo.latitude, geo.longitude) {
                (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
                _ => None,
            },
        };
        if let Some(destination) = normalized.destination.as_mut() {
            destination.geo = Some(section);
        } else if let Some(source) = normalized.source.as_mut() {
            source.geo = Some(section);
        }
    }

    if let Some(asset) = raw.enrichment.asset.as_ref() {
        normalized.host.hostname = Some(asset.hostname.clone());
        normalized.host.os = Some(OsInfo {
            family: Some(asset.os_family.clone()),
            version: Some(asset.os_version.clone()),
        });
        for (key, value) in &asset.labels {
            normalized.labels.insert(key.clone(), value.clone());
        }
        normalized.tags.extend(asset.tags.iter().cloned());
    }

    if let Some(agent) = raw.enrichment.agent.as_ref() {
        normalized.agent.version = Some(agent.version.clone());
        normalized.agent.name = Some(agent.hostname.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{parse_raw, AgentContext, AssetContext, GeoContext};

    fn raw(kind: &str, section: (&str, serde_json::Value)) -> RawEvent {
        let mut body = serde_json::json!({
            "event_id": "evt-1",
            "agent_id": "agent-7",
            "tenant_id": "11111111-2222-3333-4444-555555555555",
            "timestamp_ns": 1_700_000_000_000_000_000i64,
            "kind": kind,
        });
        body[section.0] = section.1;
        parse_raw(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn normalized_id_matches_raw_id() {
        let normalizer = Normalizer::new();
        let event = raw(
            "process_create",
            ("process", serde_json::json!({"pid": 1, "name": "init"})),
        );
        let normalized = normalizer.normalize(&event).unwrap();
        assert_eq!(normalized.event.id, event.event_id);
        assert_eq!(normalized.schema_version, SCHEMA_VERSION);
        assert_eq!(normalized.event.provider, "process_create");
    }

    #[test]
    fn every_supported_kind_populates_categories() {
        let normalizer = Normalizer::new();
        let cases = vec![
            raw("process_create", ("process", serde_json::json!({"pid": 1, "name": "sh"}))),
            raw("process_terminate", ("process", serde_json::json!({"pid": 1, "name": "sh"}))),
            raw("file_create", ("file", serde_json::json!({"path": "/tmp/a"}))),
            raw("file_modify", ("file", serde_json::json!({"path": "/tmp/a"}))),
            raw("file_delete", ("file", serde_json::json!({"path": "/tmp/a"}))),
            raw(
                "network_connect",
                ("network", serde_json::json!({"source_ip": "10.0.0.1", "destination_ip": "10.0.0.2"})),
            ),
            raw(
                "network_disconnect",
                ("network", serde_json::json!({"source_ip": "10.0.0.1", "destination_ip": "10.0.0.2"})),
            ),
            raw("dns_query", ("dns", serde_json::json!({"query_name": "example.com"}))),
        ];
        for event in cases {
            let normalized = normalizer.normalize(&event).unwrap();
            assert!(
                !normalized.event.category.is_empty(),
                "category missing for {}",
                event.kind.as_str()
            );
            assert!(
                !normalized.event.type_.is_empty(),
                "type missing for {}",
                event.kind.as_str()
            );
        }
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let normalizer = Normalizer::new();
        let body = serde_json::json!({
            "event_id": "evt-1",
            "agent_id": "agent-7",
            "tenant_id": "t",
            "timestamp_ns": 0,
            "kind": "registry_write"
        })
        .to_string();
        let event = parse_raw(body.as_bytes()).unwrap();
        let err = normalizer.normalize(&event).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
        assert!(!err.is_retryable());
    }

    #[test]
    fn enrichment_lands_on_destination_then_host_and_agent() {
        let normalizer = Normalizer::new();
        let mut event = raw(
            "network_connect",
            ("network", serde_json::json!({"source_ip": "10.0.0.1", "destination_ip": "93.184.216.34"})),
        );
        event.enrichment.geo = Some(GeoContext {
            country_iso_code: Some("US".into()),
            latitude: Some(37.75),
            longitude: Some(-97.82),
            ..Default::default()
        });
        event.enrichment.asset = Some(AssetContext {
            hostname: "workstation-9".into(),
            os_family: "linux".into(),
            os_version: "Ubuntu 22.04".into(),
            ..Default::default()
        });
        event.enrichment.agent = Some(AgentContext {
            version: "2.1.0".into(),
            hostname: "workstation-9".into(),
        });

        let normalized = normalizer.normalize(&event).unwrap();
        let destination = normalized.destination.as_ref().unwrap();
        assert_eq!(
            destination.geo.as_ref().unwrap().country_iso_code.as_deref(),
            Some("US")
        );
        assert!(destination.geo.as_ref().unwrap().location.is_some());
        assert!(normalized.source.as_ref().unwrap().geo.is_none());
        assert_eq!(normalized.host.hostname.as_deref(), Some("workstation-9"));
        assert_eq!(normalized.agent.version.as_deref(), Some("2.1.0"));
    }
}
