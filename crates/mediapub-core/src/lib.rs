//! Mediapub Core Library
//!
//! This crate provides core domain models, error types and configuration
//! that are shared across all Mediapub components: task bus messages,
//! upload and query records, hook events and the JSON-RPC envelope.

pub mod config;
pub mod error;
pub mod models;
pub mod storage_types;
pub mod task_error;

// Re-export commonly used types
pub use config::{BlobDestinationConfig, Config, LogFormat};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use storage_types::StorageBackend;
pub use task_error::{TaskError, TaskResultExt};
