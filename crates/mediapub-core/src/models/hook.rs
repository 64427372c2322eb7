//! Lifecycle events emitted by the resumable-upload protocol handler.
//!
//! The wire shape follows tusd v2 HTTP hooks:
//! `{"Type": "post-create", "Event": {"Upload": {...}, "HTTPRequest": {...}}}`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    Created,
    Progress,
    Terminated,
    CompleteUploads,
}

impl HookKind {
    pub const ALL: [HookKind; 4] = [
        HookKind::Created,
        HookKind::Progress,
        HookKind::Terminated,
        HookKind::CompleteUploads,
    ];

    /// Map a tusd hook name. Hooks with no lifecycle meaning return `None`.
    pub fn from_hook_name(name: &str) -> Option<Self> {
        match name {
            "post-create" => Some(HookKind::Created),
            "post-receive" => Some(HookKind::Progress),
            "post-terminate" => Some(HookKind::Terminated),
            "post-finish" => Some(HookKind::CompleteUploads),
            _ => None,
        }
    }
}

impl Display for HookKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            HookKind::Created => write!(f, "created"),
            HookKind::Progress => write!(f, "progress"),
            HookKind::Terminated => write!(f, "terminated"),
            HookKind::CompleteUploads => write!(f, "complete_uploads"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HookUpload {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default, rename = "MetaData")]
    pub metadata: HashMap<String, String>,
}

impl HookUpload {
    /// Client-declared file name, from `filename` or `name` metadata.
    pub fn filename(&self) -> Option<&str> {
        self.metadata
            .get("filename")
            .or_else(|| self.metadata.get("name"))
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HookHttpRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default, rename = "URI")]
    pub uri: String,
    #[serde(default)]
    pub header: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HookRequestEvent {
    pub upload: HookUpload,
    #[serde(default, rename = "HTTPRequest")]
    pub http_request: HookHttpRequest,
}

/// Body of a tusd HTTP hook request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HookRequest {
    #[serde(rename = "Type")]
    pub hook_type: String,
    pub event: HookRequestEvent,
}

impl HookRequest {
    pub fn into_event(self) -> Option<HookEvent> {
        let kind = HookKind::from_hook_name(&self.hook_type)?;
        Some(HookEvent {
            kind,
            upload: self.event.upload,
            headers: self.event.http_request.header,
        })
    }
}

/// A lifecycle event routed to the listener for its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub kind: HookKind,
    pub upload: HookUpload,
    /// Headers of the client request that caused the event.
    pub headers: HashMap<String, Vec<String>>,
}

impl HookEvent {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tusd_v2_hook() {
        let body = json!({
            "Type": "post-create",
            "Event": {
                "Upload": {
                    "ID": "abc123",
                    "Size": 9,
                    "Offset": 0,
                    "MetaData": {"filename": "dummy.md"},
                    "IsFinal": false
                },
                "HTTPRequest": {
                    "Method": "POST",
                    "URI": "/api/v1/uploads/",
                    "RemoteAddr": "127.0.0.1:1234",
                    "Header": {"Authorization": ["Bearer t0ken"]}
                }
            }
        });
        let req: HookRequest = serde_json::from_value(body).unwrap();
        let event = req.into_event().unwrap();
        assert_eq!(event.kind, HookKind::Created);
        assert_eq!(event.upload.id, "abc123");
        assert_eq!(event.upload.size, 9);
        assert_eq!(event.upload.filename(), Some("dummy.md"));
        assert_eq!(event.header("authorization"), Some("Bearer t0ken"));
    }

    #[test]
    fn unknown_hook_type_has_no_event() {
        let req = HookRequest {
            hook_type: "pre-create".into(),
            event: HookRequestEvent::default(),
        };
        assert!(req.into_event().is_none());
    }

    #[test]
    fn filename_falls_back_to_name() {
        let mut upload = HookUpload::default();
        upload.metadata.insert("name".into(), "clip.mp4".into());
        assert_eq!(upload.filename(), Some("clip.mp4"));
        upload.metadata.insert("filename".into(), String::new());
        assert_eq!(upload.filename(), None);
    }
}
