use std::sync::Arc;

use mediapub_core::models::{QueryStatus, UploadProcessResult, UploadStatus};
use mediapub_core::AppError;
use mediapub_db::UploadStore;
use mediapub_storage::UploadStorage;

/// Persists processing results into the upload and query records.
pub struct ResultRecorder {
    store: Arc<dyn UploadStore>,
    storage: Arc<dyn UploadStorage>,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn UploadStore>, storage: Arc<dyn UploadStorage>) -> Self {
        Self { store, storage }
    }

    /// Results for an already terminal query change no records. A
    /// redelivered success still retries removing the upload file.
    #[tracing::instrument(skip(self, result), fields(upload_id = %result.upload_id, retry = result.retry))]
    pub async fn record(&self, result: &UploadProcessResult) -> Result<(), AppError> {
        if result.retry {
            tracing::info!(error = %result.error, "Processing attempt failed, retry pending");
            return Ok(());
        }

        let id = result.upload_id.as_str();
        match &result.response {
            Some(response) => {
                let status = if response.is_error() || result.has_error() {
                    QueryStatus::Failed
                } else {
                    QueryStatus::Succeeded
                };
                let completed = self
                    .store
                    .complete_query(
                        id,
                        status,
                        Some(response),
                        &result.error,
                        UploadStatus::Finished,
                    )
                    .await?;
                if !completed {
                    tracing::debug!("Query already completed, result ignored");
                }
                // Also on redelivery: the previous attempt may have stopped
                // between the commit and the removal.
                self.remove_upload_file(id).await;
                if completed {
                    tracing::info!(status = %status, sd_hash = %result.sd_hash, "Upload published");
                }
            }
            None if result.has_error() => {
                let completed = self
                    .store
                    .complete_query(
                        id,
                        QueryStatus::Failed,
                        None,
                        &result.error,
                        UploadStatus::Failed,
                    )
                    .await?;
                if !completed {
                    tracing::debug!("Query already completed, result ignored");
                    return Ok(());
                }
                tracing::warn!(error = %result.error, "Upload processing failed");
            }
            None => {
                tracing::warn!("Result carries neither a response nor an error");
            }
        }
        Ok(())
    }

    async fn remove_upload_file(&self, upload_id: &str) {
        let upload = match self.store.get_upload(upload_id).await {
            Ok(Some(upload))
                if upload.status == UploadStatus::Finished && !upload.path.is_empty() =>
            {
                upload
            }
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load upload for file removal");
                return;
            }
        };
        if let Err(e) = self.storage.remove(&upload.path).await {
            tracing::warn!(error = %e, path = %upload.path, "Failed to remove finalized upload");
        }
    }
}
