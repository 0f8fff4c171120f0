//! Network connection mapper.

use super::common_envelope;
use crate::error::{CoreError, Result};
use crate::models::{EndpointSection, EventKind, NormalizedEvent, RawEvent};

pub(crate) fn map(raw: &RawEvent) -> Result<NormalizedEvent> {
    let payload = raw
        .network
        .as_ref()
        .ok_or_else(|| CoreError::invalid_request("network event without network payload"))?;

    let mut normalized = common_envelope(raw);
    normalized.event.category = vec!["network".to_string()];
    normalized.event.type_ = vec![
        "connection".to_string(),
        match raw.kind {
            EventKind::NetworkConnect => "start".to_string(),
            _ => "end".to_string(),
        },
    ];

    normalized.source = Some(EndpointSection {
        ip: Some(payload.source_ip.clone()),
        port: payload.source_port,
        bytes: payload.bytes_sent,
        geo: None,
    });
    normalized.destination = Some(EndpointSection {
        ip: Some(payload.destination_ip.clone()),
        port: payload.destination_port,
        bytes: payload.bytes_received,
        geo: None,
    });
    if let Some(protocol) = payload.protocol.as_ref() {
        normalized
            .labels
            .insert("network.transport".to_string(), protocol.clone());
    }
    if let Some(direction) = payload.direction.as_ref() {
        normalized
            .labels
            .insert("network.direction".to_string(), direction.clone());
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_raw;

    #[test]
    fn maps_both_endpoints() {
        let body = serde_json::json!({
            "event_id": "evt-1",
            "agent_id": "agent-7",
            "tenant_id": "t",
            "timestamp_ns": 0,
            "kind": "network_connect",
            "network": {
                "protocol": "tcp",
                "source_ip": "10.0.0.5",
                "source_port": 50123,
                "destination_ip": "93.184.216.34",
                "destination_port": 443
            }
        })
        .to_string();
        let raw = parse_raw(body.as_bytes()).unwrap();
        let normalized = map(&raw).unwrap();
        assert_eq!(normalized.source.unwrap().port, Some(50123));
        assert_eq!(normalized.destination.unwrap().ip.as_deref(), Some("93.184.216.34"));
        assert_eq!(normalized.labels.get("network.transport").unwrap(), "tcp");
        assert_eq!(normalized.event.type_, vec!["connection", "start"]);
    }
}
