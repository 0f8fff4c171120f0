//! File activity mapper.

use super::common_envelope;
use crate::error::{CoreError, Result};
use crate::models::{EventKind, FileSection, HashSection, NormalizedEvent, RawEvent};

pub(crate) fn map(raw: &RawEvent) -> Result<NormalizedEvent> {
    let payload = raw
        .file
        .as_ref()
        .ok_or_else(|| CoreError::invalid_request("file event without file payload"))?;

    let mut normalized = common_envelope(raw);
    normalized.event.category = vec!["file".to_string()];
    normalized.event.type_ = vec![match raw.kind {
        EventKind::FileCreate => "creation".to_string(),
        EventKind::FileDelete => "deletion".to_string(),
        _ => "change".to_string(),
    }];

    // Derive name/extension from the path when the agent left them out.
    let name = payload.name.clone().or_else(|| {
        payload
            .path
            .rsplit(['/', '\\'])
            .next()
            .map(str::to_string)
    });
    let extension = payload.extension.clone().or_else(|| {
        name.as_deref()
            .and_then(|n| n.rsplit_once('.'))
            .map(|(_, ext)| ext.to_string())
    });

    normalized.file = Some(FileSection {
        path: payload.path.clone(),
        name,
        extension,
        size: payload.size,
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
    fn derives_name_and_extension_from_path() {
        let body = serde_json::json!({
            "event_id": "evt-1",
            "agent_id": "agent-7",
            "tenant_id": "t",
            "timestamp_ns": 0,
            "kind": "file_delete",
            "file": {"path": "C:\\Users\\admin\\payload.exe"}
        })
        .to_string();
        let raw = parse_raw(body.as_bytes()).unwrap();
        let normalized = map(&raw).unwrap();
        let file = normalized.file.unwrap();
        assert_eq!(file.name.as_deref(), Some("payload.exe"));
        assert_eq!(file.extension.as_deref(), Some("exe"));
        assert_eq!(normalized.event.type_, vec!["deletion"]);
    }
}
