//! Resolving the acting user from request headers.
//!
//! The same [`UserResolver`] authenticates API requests (through
//! [`auth_middleware`]) and attributes hook events, whose forwarded client
//! headers carry the original `Authorization` header.

mod jwt;
mod middleware;

pub use jwt::{JwtClaims, JwtUserResolver};
pub use middleware::{auth_middleware, AuthUser};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use mediapub_core::AppError;
use std::collections::HashMap;

pub trait UserResolver: Send + Sync {
    /// Numeric ID of the user the headers authenticate.
    fn resolve(&self, headers: &HeaderMap) -> Result<i64, AppError>;
}

/// Rebuild a `HeaderMap` from the header map of a hook payload. Entries that
/// are not valid HTTP headers are skipped.
pub fn header_map(headers: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, values) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}

/// Token from an `Authorization: Bearer <token>` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthorized("Missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Unauthorized("Malformed authorization header".to_string()))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Expected a bearer token".to_string()))?;
    Ok(token)
}
