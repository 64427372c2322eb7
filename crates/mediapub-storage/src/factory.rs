use crate::{
    BlobStore, LocalBlobStore, LocalUploadStorage, ObjectBlobStore, S3UploadStorage,
    StorageBackend, StorageError, StorageResult, UploadStorage,
};
use mediapub_core::Config;
use std::sync::Arc;

const DEFAULT_S3_REGION: &str = "us-east-1";

/// Create the storage the resumable-upload handler writes to.
pub async fn create_upload_storage(config: &Config) -> StorageResult<Arc<dyn UploadStorage>> {
    match config.upload_storage_backend {
        StorageBackend::S3 => {
            let bucket = config
                .s3_bucket
                .clone()
                .ok_or_else(|| StorageError::ConfigError("S3_BUCKET not configured".to_string()))?;
            let region = config
                .s3_region
                .clone()
                .unwrap_or_else(|| DEFAULT_S3_REGION.to_string());
            let storage = S3UploadStorage::new(bucket, region, config.s3_endpoint.clone())?;
            Ok(Arc::new(storage))
        }
        StorageBackend::Local => {
            let storage = LocalUploadStorage::new(config.uploads_dir.clone()).await?;
            Ok(Arc::new(storage))
        }
    }
}

/// Create every configured blob destination, in configuration order.
pub async fn create_blob_stores(config: &Config) -> StorageResult<Vec<Arc<dyn BlobStore>>> {
    let mut stores: Vec<Arc<dyn BlobStore>> = Vec::with_capacity(config.blob_destinations.len());
    for destination in &config.blob_destinations {
        let store: Arc<dyn BlobStore> = match destination.backend {
            StorageBackend::Local => Arc::new(
                LocalBlobStore::new(destination.name.clone(), destination.location.clone()).await?,
            ),
            StorageBackend::S3 => Arc::new(ObjectBlobStore::s3(
                destination.name.clone(),
                &destination.location,
                config.s3_region.as_deref().unwrap_or(DEFAULT_S3_REGION),
                config.s3_endpoint.as_deref(),
            )?),
        };
        tracing::info!(
            destination = %destination.name,
            backend = %destination.backend,
            "Blob destination configured"
        );
        stores.push(store);
    }
    Ok(stores)
}
