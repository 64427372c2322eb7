//! Shared key generation and validation for storage backends.
//!
//! Finalised uploads: `{user_id}/{upload_id}/{filename}`.
//! Blobs: `{hash[..2]}/{hash[2..]}` on the filesystem, `blobs/{hash}` in object stores.

use crate::traits::{StorageError, StorageResult};

pub const SHA384_HEX_LEN: usize = 96;

/// Upload IDs come from the protocol handler; they must be a single path segment.
pub fn validate_upload_id(upload_id: &str) -> StorageResult<()> {
    if upload_id.is_empty()
        || upload_id.contains("..")
        || upload_id.contains('/')
        || upload_id.contains('\\')
    {
        return Err(StorageError::InvalidKey(format!(
            "invalid upload id: {upload_id}"
        )));
    }
    Ok(())
}

/// Reduce a client-supplied filename to its last path segment.
pub fn sanitize_filename(filename: &str) -> StorageResult<String> {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(StorageError::InvalidKey(format!(
            "invalid filename: {filename:?}"
        )));
    }
    Ok(name.to_string())
}

pub fn finalized_key(upload_id: &str, user_id: i64, filename: &str) -> StorageResult<String> {
    validate_upload_id(upload_id)?;
    let filename = sanitize_filename(filename)?;
    Ok(format!("{user_id}/{upload_id}/{filename}"))
}

pub fn info_key(upload_id: &str) -> String {
    format!("{upload_id}.info")
}

pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == SHA384_HEX_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn validate_hash(hash: &str) -> StorageResult<()> {
    if !is_valid_hash(hash) {
        return Err(StorageError::InvalidKey(format!("invalid blob hash: {hash}")));
    }
    Ok(())
}

pub fn blob_object_key(hash: &str) -> StorageResult<String> {
    validate_hash(hash)?;
    Ok(format!("blobs/{hash}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_key_uses_basename() {
        assert_eq!(
            finalized_key("abc123", 7, "../../etc/passwd").unwrap(),
            "7/abc123/passwd"
        );
        assert_eq!(
            finalized_key("abc123", 7, "dummy.md").unwrap(),
            "7/abc123/dummy.md"
        );
    }

    #[test]
    fn rejects_traversal_in_upload_id() {
        assert!(finalized_key("../x", 1, "a.txt").is_err());
        assert!(finalized_key("a/b", 1, "a.txt").is_err());
        assert!(finalized_key("ok", 1, "..").is_err());
        assert!(finalized_key("ok", 1, "dir/").is_err());
    }

    #[test]
    fn hash_validation() {
        let good = "a".repeat(96);
        assert!(is_valid_hash(&good));
        assert!(!is_valid_hash(&"A".repeat(96)));
        assert!(!is_valid_hash("abc"));
        assert!(blob_object_key("../secret").is_err());
    }
}
