//! In-process [`UploadStore`] with the same transition rules as Postgres.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use mediapub_core::models::{Query, QueryStatus, RpcResponse, Upload, UploadStatus};
use mediapub_core::AppError;

use crate::upload::UploadStore;

#[derive(Debug, Default)]
struct Records {
    uploads: HashMap<String, Upload>,
    queries: HashMap<String, Query>,
}

#[derive(Debug, Default)]
pub struct MemoryUploadStore {
    records: RwLock<Records>,
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a transferring upload. Returns whether it applied.
    async fn update_transferring(&self, id: &str, f: impl FnOnce(&mut Upload)) -> bool {
        let mut records = self.records.write().await;
        match records.uploads.get_mut(id) {
            Some(upload) if upload.status.is_transferring() => {
                f(upload);
                upload.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl UploadStore for MemoryUploadStore {
    async fn create_upload(&self, upload: &Upload) -> Result<bool, AppError> {
        let mut records = self.records.write().await;
        if records.uploads.contains_key(&upload.id) {
            return Ok(false);
        }
        records.uploads.insert(upload.id.clone(), upload.clone());
        Ok(true)
    }

    async fn get_upload(&self, id: &str) -> Result<Option<Upload>, AppError> {
        Ok(self.records.read().await.uploads.get(id).cloned())
    }

    async fn record_progress(&self, id: &str, received: i64) -> Result<bool, AppError> {
        Ok(self
            .update_transferring(id, |upload| {
                upload.received = received;
                upload.status = UploadStatus::Uploading;
            })
            .await)
    }

    async fn mark_transferred(&self, id: &str) -> Result<bool, AppError> {
        Ok(self
            .update_transferring(id, |upload| upload.received = upload.size)
            .await)
    }

    async fn mark_terminated(&self, id: &str) -> Result<bool, AppError> {
        Ok(self
            .update_transferring(id, |upload| upload.status = UploadStatus::Terminated)
            .await)
    }

    async fn mark_received(&self, id: &str, path: &str, query: &Query) -> Result<(), AppError> {
        let mut records = self.records.write().await;
        let upload = records
            .uploads
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("upload {id}")))?;
        upload.status = UploadStatus::Received;
        upload.path = path.to_string();
        upload.received = upload.size;
        upload.updated_at = Utc::now();

        let mut query = query.clone();
        query.upload_id = id.to_string();
        records.queries.insert(id.to_string(), query);
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), AppError> {
        if let Some(upload) = self.records.write().await.uploads.get_mut(id) {
            upload.status = UploadStatus::Failed;
            upload.error = error.to_string();
            upload.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_query(&self, upload_id: &str) -> Result<Option<Query>, AppError> {
        Ok(self.records.read().await.queries.get(upload_id).cloned())
    }

    async fn complete_query(
        &self,
        upload_id: &str,
        status: QueryStatus,
        response: Option<&RpcResponse>,
        error: &str,
        upload_status: UploadStatus,
    ) -> Result<bool, AppError> {
        let mut records = self.records.write().await;
        let Records { uploads, queries } = &mut *records;
        let query = match queries.get_mut(upload_id) {
            Some(query) if !query.status.is_terminal() => query,
            _ => return Ok(false),
        };
        query.status = status;
        query.response = response.cloned();
        query.error = error.to_string();
        query.updated_at = Utc::now();

        if let Some(upload) = uploads.get_mut(upload_id) {
            upload.status = upload_status;
            if upload_status == UploadStatus::Failed {
                upload.error = error.to_string();
            }
            upload.updated_at = Utc::now();
        }
        Ok(true)
    }
}
