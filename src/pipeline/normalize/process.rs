//! Process lifecycle mapper.

use super::common_envelope;
use crate::error::{CoreError, Result};
use crate::models::{
    EventKind, HashSection, NormalizedEvent, ParentProcessSection, ProcessSection, RawEvent,
};

pub(crate) fn map(raw: &RawEvent) -> Result<NormalizedEvent> {
    let payload = raw
        .process
        .as_ref()
        .ok_or_else(|| CoreError::invalid_request("process event without process payload"))?;

    let mut normalized = common_envelope(raw);
    normalized.event.category = vec!["process".to_string()];
    normalized.event.type_ = vec![match raw.kind {
        EventKind::ProcessCreate => "start".to_string(),
        _ => "end".to_string(),
    }];

    let parent = match (payload.ppid, payload.parent_name.as_ref()) {
        (None, None) => None,
        (pid, name) => Some(ParentProcessSection { pid, name: name.cloned() }),
    };

    normalized.process = Some(ProcessSection {
        pid: payload.pid,
        name: payload.name.clone(),
        executable: payload.executable.clone(),
        command_line: payload.command_line.clone(),
        user: payload.user.clone(),
        parent,
        hash: payload
            .sha256
            .as_ref()
            .map(|sha256| HashSection { sha256: Some(sha256.clone()) }),
    });

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_raw;

    #[test]
    fn maps_parent_and_hash() {
        let body = serde_json::json!({
            "event_id": "evt-1",
            "agent_id": "agent-7",
            "tenant_id": "t",
            "timestamp_ns": 0,
            "kind": "process_create",
            "process": {
                "pid": 100,
                "ppid": 1,
                "name": "curl",
                "parent_name": "bash",
                "sha256": "deadbeef"
            }
        })
        .to_string();
        let raw = parse_raw(body.as_bytes()).unwrap();
        let normalized = map(&raw).unwrap();
        let process = normalized.process.unwrap();
        assert_eq!(process.parent.unwrap().pid, Some(1));
        assert_eq!(process.hash.unwrap().sha256.as_deref(), Some("deadbeef"));
        assert_eq!(normalized.event.type_, vec!["start"]);
    }

    #[test]
    fn missing_payload_is_invalid() {
        let body = serde_json::json!({
            "event_id": "evt-1",
            "agent_id": "agent-7",
            "tenant_id": "t",
            "timestamp_ns": 0,
            "kind": "process_terminate"
        })
        .to_string();
        let raw = parse_raw(body.as_bytes()).unwrap();
        assert!(map(&raw).is_err());
    }
}
