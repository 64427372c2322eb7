use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use mediapub_core::AppError;
use serde::{Deserialize, Serialize};

use super::{bearer_token, UserResolver};

/// HS256 claims. `sub` is the numeric user ID as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: usize,
}

/// Verifies HS256 bearer tokens signed with the configured secret.
pub struct JwtUserResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtUserResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl UserResolver for JwtUserResolver {
    fn resolve(&self, headers: &HeaderMap) -> Result<i64, AppError> {
        let token = bearer_token(headers)?;
        let data = decode::<JwtClaims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            AppError::Unauthorized("Invalid or expired token".to_string())
        })?;
        data.claims
            .sub
            .parse::<i64>()
            .map_err(|_| AppError::Unauthorized("Token subject is not a user ID".to_string()))
    }
}
