use crate::keys;
use crate::traits::{BlobStore, LocalFile, StorageError, StorageResult, UploadInfo, UploadStorage};
use crate::tusd;
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

async fn ensure_dir(path: &Path) -> StorageResult<()> {
    fs::create_dir_all(path).await.map_err(|e| {
        StorageError::ConfigError(format!(
            "Failed to create storage directory {}: {}",
            path.display(),
            e
        ))
    })
}

async fn ensure_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Upload storage over tusd's `filestore` layout.
///
/// In-flight uploads are `<base>/<id>` with `<base>/<id>.info`; finalised
/// uploads move to `<base>/<user_id>/<id>/<filename>`.
#[derive(Clone, Debug)]
pub struct LocalUploadStorage {
    base_path: PathBuf,
}

impl LocalUploadStorage {
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        ensure_dir(&base_path).await?;
        Ok(LocalUploadStorage { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a locator and refuse anything outside the base directory.
    fn locator_to_path(&self, locator: &str) -> StorageResult<PathBuf> {
        if locator.contains("..") {
            return Err(StorageError::InvalidKey(
                "Locator contains invalid characters".to_string(),
            ));
        }
        let path = PathBuf::from(locator);
        let path = if path.is_absolute() {
            path
        } else {
            self.base_path.join(path)
        };

        let base_canonical = self.base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;
        let inside = match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&base_canonical),
            Err(_) => path.starts_with(&self.base_path) || path.starts_with(&base_canonical),
        };
        if !inside {
            return Err(StorageError::InvalidKey(
                "Locator resolves outside upload directory".to_string(),
            ));
        }
        Ok(path)
    }
}

#[async_trait]
impl UploadStorage for LocalUploadStorage {
    async fn info(&self, upload_id: &str) -> StorageResult<UploadInfo> {
        keys::validate_upload_id(upload_id)?;
        let info_path = self.base_path.join(keys::info_key(upload_id));
        let raw = match fs::read(&info_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(upload_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        // filestore does not keep Offset current; the data file length is authoritative.
        let stored_len = match fs::metadata(self.base_path.join(upload_id)).await {
            Ok(meta) => Some(meta.len() as i64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(0),
            Err(e) => return Err(e.into()),
        };
        tusd::parse_info(upload_id, &raw, stored_len)
    }

    async fn finalize(
        &self,
        upload_id: &str,
        user_id: i64,
        filename: &str,
    ) -> StorageResult<String> {
        let key = keys::finalized_key(upload_id, user_id, filename)?;
        let src = self.base_path.join(upload_id);
        let dest = self.base_path.join(&key);

        if !fs::try_exists(&src).await.unwrap_or(false) {
            return Err(StorageError::NotFound(upload_id.to_string()));
        }
        ensure_parent_dir(&dest).await?;

        fs::rename(&src, &dest).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to move {} to {}: {}",
                src.display(),
                dest.display(),
                e
            ))
        })?;

        match fs::remove_file(self.base_path.join(keys::info_key(upload_id))).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(error = %e, upload_id = %upload_id, "Failed to remove upload info file")
            }
        }

        tracing::info!(
            upload_id = %upload_id,
            user_id = user_id,
            path = %dest.display(),
            "Upload finalized"
        );
        Ok(dest.to_string_lossy().into_owned())
    }

    async fn retrieve(&self, locator: &str) -> StorageResult<LocalFile> {
        let path = self.locator_to_path(locator)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(locator.to_string()));
        }
        Ok(LocalFile::persistent(path))
    }

    async fn remove(&self, locator: &str) -> StorageResult<()> {
        let path = self.locator_to_path(locator)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::DeleteFailed(format!(
                    "Failed to delete file {}: {}",
                    path.display(),
                    e
                )))
            }
        }
        // Drop the now empty `<user>/<id>` directory; anything else stays.
        if let Some(parent) = path.parent() {
            if parent != self.base_path {
                let _ = fs::remove_dir(parent).await;
            }
        }
        tracing::info!(path = %path.display(), "Finalized upload removed");
        Ok(())
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}

/// Blob destination on the local filesystem, fanned out as `<root>/ab/cdef…`.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    name: String,
    root: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        ensure_dir(&root).await?;
        Ok(LocalBlobStore {
            name: name.into(),
            root,
        })
    }

    fn blob_path(&self, hash: &str) -> StorageResult<PathBuf> {
        keys::validate_hash(hash)?;
        Ok(self.root.join(&hash[..2]).join(&hash[2..]))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, hash: &str, data: Bytes) -> StorageResult<()> {
        let path = self.blob_path(hash)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        ensure_parent_dir(&path).await?;

        // Write aside and rename so readers never see a partial blob.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", tmp.display(), e))
        })?;
        file.write_all(&data).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to write file {}: {}", tmp.display(), e))
        })?;
        file.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to store blob {}: {}", hash, e))
        })?;

        tracing::debug!(destination = %self.name, hash = %hash, size_bytes = data.len(), "Blob stored");
        Ok(())
    }

    async fn exists(&self, hash: &str) -> StorageResult<bool> {
        let path = self.blob_path(hash)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn get(&self, hash: &str) -> StorageResult<Bytes> {
        let path = self.blob_path(hash)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(hash.to_string()))
            }
            Err(e) => Err(StorageError::DownloadFailed(format!(
                "Failed to read blob {}: {}",
                hash, e
            ))),
        }
    }
}
