//! API constants

/// Prefix of every versioned route.
pub const API_PREFIX: &str = "/api/v1";

/// Largest accepted request body (hook payloads and RPC templates).
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn status_url(upload_id: &str) -> String {
    format!("{API_PREFIX}/uploads/{upload_id}/status")
}
