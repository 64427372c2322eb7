//! The `<id>.info` document tusd writes next to every upload.

use serde::Deserialize;
use std::collections::HashMap;

use crate::traits::{StorageError, StorageResult, UploadInfo};

#[derive(Debug, Deserialize)]
struct InfoFile {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Size", default)]
    size: i64,
    #[serde(rename = "Offset", default)]
    offset: i64,
    #[serde(rename = "MetaData", default)]
    metadata: Option<HashMap<String, String>>,
}

/// Parse an info document. `stored_len`, when known, is the byte count
/// actually present in the backend and overrides the recorded offset.
pub(crate) fn parse_info(
    upload_id: &str,
    raw: &[u8],
    stored_len: Option<i64>,
) -> StorageResult<UploadInfo> {
    let info: InfoFile = serde_json::from_slice(raw).map_err(|e| {
        StorageError::BackendError(format!("malformed info file for upload {upload_id}: {e}"))
    })?;
    Ok(UploadInfo {
        id: if info.id.is_empty() {
            upload_id.to_string()
        } else {
            info.id
        },
        size: info.size,
        offset: stored_len.unwrap_or(info.offset),
        metadata: info.metadata.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filestore_info() {
        let raw = br#"{"ID":"abc","Size":9,"SizeIsDeferred":false,"Offset":0,
            "MetaData":{"filename":"dummy.md"},"IsPartial":false,"IsFinal":false,
            "PartialUploads":null,"Storage":{"Path":"/uploads/abc","Type":"filestore"}}"#;
        let info = parse_info("abc", raw, Some(9)).unwrap();
        assert_eq!(info.size, 9);
        assert_eq!(info.offset, 9);
        assert!(info.is_complete());
        assert_eq!(info.metadata.get("filename").map(String::as_str), Some("dummy.md"));
    }

    #[test]
    fn null_metadata_is_empty() {
        let info = parse_info("x", br#"{"Size":3,"Offset":1,"MetaData":null}"#, None).unwrap();
        assert_eq!(info.id, "x");
        assert_eq!(info.offset, 1);
        assert!(info.metadata.is_empty());
    }
}
