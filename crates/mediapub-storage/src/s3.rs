use crate::keys;
use crate::traits::{BlobStore, LocalFile, StorageError, StorageResult, UploadInfo, UploadStorage};
use crate::tusd;
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload, Result as ObjectResult};
use std::sync::Arc;
use tempfile::TempDir;

/// Build an S3 object store from the environment plus explicit settings.
///
/// `endpoint_url` selects an S3-compatible provider (for example
/// `http://localhost:9000` for MinIO); plain HTTP is allowed only when the
/// endpoint itself is plain HTTP.
pub fn build_s3_store(
    bucket: &str,
    region: &str,
    endpoint_url: Option<&str>,
) -> StorageResult<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::from_env()
        .with_region(region)
        .with_bucket_name(bucket);

    if let Some(endpoint) = endpoint_url {
        let allow_http = endpoint.starts_with("http://");
        builder = builder.with_endpoint(endpoint).with_allow_http(allow_http);
    }

    let store = builder
        .build()
        .map_err(|e| StorageError::ConfigError(e.to_string()))?;
    Ok(Arc::new(store))
}

async fn read_object(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> StorageResult<Bytes> {
    let location = Path::from(key.to_string());
    let result: ObjectResult<_> = store.get(&location).await;
    let result = result.map_err(|e| match e {
        ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => {
            tracing::error!(error = %other, bucket = %bucket, key = %key, "S3 download failed");
            StorageError::DownloadFailed(other.to_string())
        }
    })?;
    result
        .bytes()
        .await
        .map_err(|e| StorageError::DownloadFailed(e.to_string()))
}

async fn object_size(store: &dyn ObjectStore, key: &str) -> StorageResult<Option<u64>> {
    match store.head(&Path::from(key.to_string())).await {
        Ok(meta) => Ok(Some(meta.size)),
        Err(ObjectStoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(StorageError::BackendError(e.to_string())),
    }
}

/// Upload storage over tusd's `s3store` layout: `<id>` and `<id>.info` at the
/// bucket root, finalised uploads under `<user_id>/<id>/<filename>`.
#[derive(Clone)]
pub struct S3UploadStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl std::fmt::Debug for S3UploadStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3UploadStorage")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3UploadStorage {
    pub fn new(bucket: String, region: String, endpoint_url: Option<String>) -> StorageResult<Self> {
        let store = build_s3_store(&bucket, &region, endpoint_url.as_deref())?;
        Ok(Self::from_store(store, bucket))
    }

    pub fn from_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        S3UploadStorage {
            store,
            bucket: bucket.into(),
        }
    }

    fn validate_locator(locator: &str) -> StorageResult<()> {
        if locator.is_empty() || locator.contains("..") || locator.starts_with('/') {
            return Err(StorageError::InvalidKey(format!("invalid locator: {locator}")));
        }
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> StorageResult<()> {
        let result: ObjectResult<_> = self.store.delete(&Path::from(key.to_string())).await;
        match result {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, bucket = %self.bucket, key = %key, "S3 delete failed");
                Err(StorageError::DeleteFailed(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl UploadStorage for S3UploadStorage {
    async fn info(&self, upload_id: &str) -> StorageResult<UploadInfo> {
        keys::validate_upload_id(upload_id)?;
        let raw = read_object(self.store.as_ref(), &self.bucket, &keys::info_key(upload_id)).await?;
        // The data object only exists once the multipart upload completed.
        let stored_len = object_size(self.store.as_ref(), upload_id)
            .await?
            .map(|len| len as i64);
        tusd::parse_info(upload_id, &raw, stored_len)
    }

    async fn finalize(
        &self,
        upload_id: &str,
        user_id: i64,
        filename: &str,
    ) -> StorageResult<String> {
        let key = keys::finalized_key(upload_id, user_id, filename)?;
        let from = Path::from(upload_id.to_string());
        let to = Path::from(key.clone());

        let copy_result: ObjectResult<_> = self.store.copy(&from, &to).await;
        copy_result.map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(upload_id.to_string()),
            other => StorageError::UploadFailed(format!(
                "Failed to copy {} to {}: {}",
                upload_id, key, other
            )),
        })?;

        self.delete_key(upload_id).await?;
        if let Err(e) = self.delete_key(&keys::info_key(upload_id)).await {
            tracing::warn!(error = %e, upload_id = %upload_id, "Failed to remove upload info object");
        }

        tracing::info!(
            bucket = %self.bucket,
            upload_id = %upload_id,
            user_id = user_id,
            key = %key,
            "Upload finalized"
        );
        Ok(key)
    }

    async fn retrieve(&self, locator: &str) -> StorageResult<LocalFile> {
        Self::validate_locator(locator)?;
        let start = std::time::Instant::now();
        let data = read_object(self.store.as_ref(), &self.bucket, locator).await?;

        let filename = keys::sanitize_filename(locator)?;
        let dir = TempDir::new()?;
        let path = dir.path().join(filename);
        tokio::fs::write(&path, &data).await?;

        tracing::info!(
            bucket = %self.bucket,
            key = %locator,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Finalized upload downloaded for processing"
        );
        Ok(LocalFile::temporary(path, dir))
    }

    async fn remove(&self, locator: &str) -> StorageResult<()> {
        Self::validate_locator(locator)?;
        self.delete_key(locator).await
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}

/// Blob destination on any `object_store` backend, keyed `blobs/<hash>`.
#[derive(Clone)]
pub struct ObjectBlobStore {
    name: String,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for ObjectBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBlobStore")
            .field("name", &self.name)
            .finish()
    }
}

impl ObjectBlobStore {
    pub fn new(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        ObjectBlobStore {
            name: name.into(),
            store,
        }
    }

    pub fn s3(
        name: impl Into<String>,
        bucket: &str,
        region: &str,
        endpoint_url: Option<&str>,
    ) -> StorageResult<Self> {
        Ok(Self::new(name, build_s3_store(bucket, region, endpoint_url)?))
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, hash: &str, data: Bytes) -> StorageResult<()> {
        let key = keys::blob_object_key(hash)?;
        let size = data.len();
        let result: ObjectResult<_> = self
            .store
            .put(&Path::from(key.clone()), PutPayload::from(data))
            .await;
        result.map_err(|e| {
            tracing::warn!(error = %e, destination = %self.name, key = %key, "Blob upload failed");
            StorageError::UploadFailed(e.to_string())
        })?;
        tracing::debug!(destination = %self.name, hash = %hash, size_bytes = size, "Blob stored");
        Ok(())
    }

    async fn exists(&self, hash: &str) -> StorageResult<bool> {
        let key = keys::blob_object_key(hash)?;
        Ok(object_size(self.store.as_ref(), &key).await?.is_some())
    }

    async fn get(&self, hash: &str) -> StorageResult<Bytes> {
        let key = keys::blob_object_key(hash)?;
        read_object(self.store.as_ref(), &self.name, &key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    async fn seed(store: &Arc<dyn ObjectStore>, key: &str, data: &'static [u8]) {
        store
            .put(&Path::from(key), PutPayload::from_static(data))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finalize_and_retrieve_through_temp_file() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        seed(&store, "up1", b"123456789").await;
        seed(
            &store,
            "up1.info",
            br#"{"ID":"up1","Size":9,"Offset":0,"MetaData":{"filename":"dummy.md"}}"#,
        )
        .await;
        let storage = S3UploadStorage::from_store(store.clone(), "uploads");

        let info = storage.info("up1").await.unwrap();
        assert!(info.is_complete());

        let locator = storage.finalize("up1", 5, "dummy.md").await.unwrap();
        assert_eq!(locator, "5/up1/dummy.md");
        assert!(object_size(store.as_ref(), "up1").await.unwrap().is_none());
        assert!(object_size(store.as_ref(), "up1.info").await.unwrap().is_none());

        let file = storage.retrieve(&locator).await.unwrap();
        assert!(file.is_temporary());
        assert!(file.path().ends_with("dummy.md"));
        assert_eq!(tokio::fs::read(file.path()).await.unwrap(), b"123456789");
        let temp_path = file.path().to_path_buf();
        drop(file);
        assert!(!temp_path.exists());

        storage.remove(&locator).await.unwrap();
        assert!(storage.retrieve(&locator).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn incomplete_upload_uses_recorded_offset() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        seed(&store, "up2.info", br#"{"ID":"up2","Size":9,"Offset":4}"#).await;
        let storage = S3UploadStorage::from_store(store, "uploads");
        let info = storage.info("up2").await.unwrap();
        assert_eq!(info.offset, 4);
        assert!(!info.is_complete());
    }

    #[tokio::test]
    async fn object_blob_store_round_trip() {
        let blobs = ObjectBlobStore::new("memory", Arc::new(InMemory::new()));
        let hash = "f".repeat(96);
        assert!(!blobs.exists(&hash).await.unwrap());
        blobs.put(&hash, Bytes::from_static(b"chunk")).await.unwrap();
        assert!(blobs.exists(&hash).await.unwrap());
        assert_eq!(blobs.get(&hash).await.unwrap(), Bytes::from_static(b"chunk"));
    }
}
