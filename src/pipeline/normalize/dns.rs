//! DNS query mapper.

use super::common_envelope;
use crate::error::{CoreError, Result};
use crate::models::{DnsQuestion, DnsSection, NormalizedEvent, RawEvent};

pub(crate) fn map(raw: &RawEvent) -> Result<NormalizedEvent> {
    let payload = raw
        .dns
        .as_ref()
        .ok_or_else(|| CoreError::invalid_request("dns event without dns payload"))?;

    let mut normalized = common_envelope(raw);
    normalized.event.category = vec!["network".to_string()];
    normalized.event.type_ = vec!["protocol".to_string(), "info".to_string()];

    normalized.dns = Some(DnsSection {
        question: DnsQuestion {
            name: payload.query_name.clone(),
            type_: payload.query_type.clone(),
        },
        response_code: payload.response_code.clone(),
        resolved_ip: payload.resolved_ips.clone(),
    });
    normalized
        .labels
        .insert("network.protocol".to_string(), "dns".to_string());

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_raw;

    #[test]
    fn maps_question_and_answers() {
        let body = serde_json::json!({
            "event_id": "evt-1",
            "agent_id": "agent-7",
            "tenant_id": "t",
            "timestamp_ns": 0,
            "kind": "dns_query",
            "dns": {
                "query_name": "internal.corp",
                "query_type": "A",
                "response_code": "NOERROR",
                "resolved_ips": ["10.1.2.3", "10.1.2.4"]
            }
        })
        .to_string();
        let raw = parse_raw(body.as_bytes()).unwrap();
        let normalized = map(&raw).unwrap();
        let dns = normalized.dns.unwrap();
        assert_eq!(dns.question.name, "internal.corp");
        assert_eq!(dns.resolved_ip.len(), 2);
        assert_eq!(normalized.event.category, vec!["network"]);
    }
}
