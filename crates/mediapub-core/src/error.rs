//! Request-path errors.
//!
//! Handlers, the notify orchestrator and the repositories all fail with
//! [`AppError`]. Each variant knows how it is shown to a client (status,
//! code, whether it may be retried) through [`ErrorMetadata`], so the HTTP
//! layer only has to render it.
//!
//! Without the `sqlx` feature, `Database` carries a plain message.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Level an error is logged at when it reaches the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Caller mistakes: bad token, unknown upload, repeated notify.
    Debug,
    /// Transient contention.
    Warn,
    Error,
}

/// How an error presents itself in an HTTP response.
pub trait ErrorMetadata {
    fn http_status_code(&self) -> u16;

    /// Stable machine-readable code, e.g. `"LOCK_UNAVAILABLE"`.
    fn error_code(&self) -> &'static str;

    /// True when repeating the same request may succeed.
    fn is_recoverable(&self) -> bool;

    fn suggested_action(&self) -> Option<&'static str>;

    /// Message safe to return to the caller.
    fn client_message(&self) -> String;

    /// True when the internal message must not leave the server.
    fn is_sensitive(&self) -> bool;

    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The upload is in a state that does not allow the request.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Another request holds the upload's lock.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Task broker error: {0}")]
    Broker(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("malformed JSON: {}", err))
    }
}

const RETRY_LATER: Option<&str> = Some("Retry after a short delay");

struct Presentation {
    status: u16,
    code: &'static str,
    recoverable: bool,
    action: Option<&'static str>,
    sensitive: bool,
    level: LogLevel,
}

impl Presentation {
    /// A caller mistake: shown verbatim, never retried as-is.
    const fn rejected(status: u16, code: &'static str, action: Option<&'static str>) -> Self {
        Self {
            status,
            code,
            recoverable: false,
            action,
            sensitive: false,
            level: LogLevel::Debug,
        }
    }

    /// A server-side failure: hidden from the caller, worth retrying.
    const fn failed(code: &'static str) -> Self {
        Self {
            status: 500,
            code,
            recoverable: true,
            action: RETRY_LATER,
            sensitive: true,
            level: LogLevel::Error,
        }
    }
}

impl AppError {
    fn presentation(&self) -> Presentation {
        match self {
            AppError::InvalidInput(_) => Presentation::rejected(
                400,
                "INVALID_INPUT",
                Some("Check the request body and try again"),
            ),
            AppError::NotFound(_) => {
                Presentation::rejected(404, "NOT_FOUND", Some("Verify the upload ID exists"))
            }
            AppError::Forbidden(_) => Presentation::rejected(403, "FORBIDDEN", None),
            AppError::Unauthorized(_) => Presentation::rejected(
                401,
                "UNAUTHORIZED",
                Some("Send a valid bearer token"),
            ),
            AppError::Conflict(_) => Presentation::rejected(
                409,
                "CONFLICT",
                Some("Poll the upload status instead of notifying again"),
            ),
            AppError::LockUnavailable(_) => Presentation {
                sensitive: false,
                level: LogLevel::Warn,
                ..Presentation::failed("LOCK_UNAVAILABLE")
            },
            AppError::Database(_) => Presentation::failed("DATABASE_ERROR"),
            AppError::Broker(_) => Presentation::failed("BROKER_ERROR"),
            AppError::Storage(_) => Presentation::failed("STORAGE_ERROR"),
            AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                Presentation::failed("INTERNAL_ERROR")
            }
        }
    }

    /// Variant name, logged alongside the message.
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::NotFound(_) => "NotFound",
            AppError::Forbidden(_) => "Forbidden",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::Conflict(_) => "Conflict",
            AppError::LockUnavailable(_) => "LockUnavailable",
            AppError::Broker(_) => "Broker",
            AppError::Storage(_) => "Storage",
            AppError::Internal(_) | AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// The message followed by up to five levels of its source chain.
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();
        let mut chain = std::iter::successors(self.source(), |&err| err.source());
        for cause in chain.by_ref().take(5) {
            details.push_str(&format!("\n  Caused by: {}", cause));
        }
        if chain.next().is_some() {
            details.push_str("\n  ... (truncated)");
        }
        details
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        self.presentation().status
    }

    fn error_code(&self) -> &'static str {
        self.presentation().code
    }

    fn is_recoverable(&self) -> bool {
        self.presentation().recoverable
    }

    fn suggested_action(&self) -> Option<&'static str> {
        self.presentation().action
    }

    fn is_sensitive(&self) -> bool {
        self.presentation().sensitive
    }

    fn log_level(&self) -> LogLevel {
        self.presentation().level
    }

    fn client_message(&self) -> String {
        match self {
            AppError::InvalidInput(msg)
            | AppError::NotFound(msg)
            | AppError::Forbidden(msg)
            | AppError::Unauthorized(msg)
            | AppError::Conflict(msg) => msg.clone(),
            AppError::LockUnavailable(_) => "Upload is busy, try again later".to_string(),
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::Broker(_) => "Failed to schedule processing".to_string(),
            AppError::Storage(_) => "Failed to access storage".to_string(),
            AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                "Internal server error".to_string()
            }
        }
    }
}
