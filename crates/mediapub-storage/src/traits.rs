//! Storage abstraction traits
//!
//! [`UploadStorage`] covers the resumable-upload side, [`BlobStore`] a single
//! content-addressed blob destination.

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<StorageError> for mediapub_core::AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => mediapub_core::AppError::NotFound(what),
            StorageError::InvalidKey(msg) => mediapub_core::AppError::InvalidInput(msg),
            other => mediapub_core::AppError::Storage(other.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Upload state as recorded by the resumable-upload protocol handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInfo {
    pub id: String,
    /// Declared size in bytes.
    pub size: i64,
    /// Bytes actually stored.
    pub offset: i64,
    pub metadata: HashMap<String, String>,
}

impl UploadInfo {
    pub fn is_complete(&self) -> bool {
        self.offset == self.size
    }
}

/// A file available on the local filesystem for the duration of processing.
///
/// Files downloaded from a remote backend live in a temporary directory that
/// is removed when the `LocalFile` is dropped. Files that already were local
/// are left alone.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    _temp_dir: Option<TempDir>,
}

impl LocalFile {
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _temp_dir: None,
        }
    }

    pub fn temporary(path: impl Into<PathBuf>, dir: TempDir) -> Self {
        Self {
            path: path.into(),
            _temp_dir: Some(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self._temp_dir.is_some()
    }
}

/// Storage the resumable-upload protocol handler writes to.
///
/// A *locator* is the backend-specific address of a finalised upload: an
/// absolute path for the local backend, an object key for S3. It is what the
/// upload record stores in its `path` column.
#[async_trait]
pub trait UploadStorage: Send + Sync {
    /// Read the protocol's bookkeeping for an in-flight upload.
    async fn info(&self, upload_id: &str) -> StorageResult<UploadInfo>;

    /// Move a completed upload to `<user_id>/<upload_id>/<filename>`, drop the
    /// protocol metadata and return the new locator.
    async fn finalize(&self, upload_id: &str, user_id: i64, filename: &str)
        -> StorageResult<String>;

    /// Make a finalised upload available as a local file.
    async fn retrieve(&self, locator: &str) -> StorageResult<LocalFile>;

    /// Delete a finalised upload. Missing files are not an error.
    async fn remove(&self, locator: &str) -> StorageResult<()>;

    fn backend_type(&self) -> StorageBackend;
}

/// One content-addressed blob destination.
///
/// Blobs are immutable: writing a hash that already exists is a no-op as far
/// as callers are concerned.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name recorded in the blob index for this destination.
    fn name(&self) -> &str;

    async fn put(&self, hash: &str, data: Bytes) -> StorageResult<()>;

    async fn exists(&self, hash: &str) -> StorageResult<bool>;

    async fn get(&self, hash: &str) -> StorageResult<Bytes>;
}
