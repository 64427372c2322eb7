//! Upload orchestration: hook bookkeeping, the notify step that hands a
//! finished upload to processing, and the status a polling client sees.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use mediapub_core::models::{
    HookEvent, HookKind, PublishStatus, Query, RpcRequest, TaskOptions, Upload,
    UploadProcessPayload,
};
use mediapub_core::AppError;
use mediapub_db::UploadStore;
use mediapub_infra::{DistributedLock, RetryPolicy};
use mediapub_storage::UploadStorage;
use mediapub_worker::TaskProducer;

use crate::auth::{header_map, UserResolver};
use crate::hooks::HookListener;

pub const PROCESS_MAX_RETRY: u32 = 10;
pub const PROCESS_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
pub const PROCESS_RETENTION: Duration = Duration::from_secs(72 * 60 * 60);

fn lock_key(upload_id: &str) -> String {
    format!("upload:{upload_id}")
}

pub struct UploadOrchestrator {
    store: Arc<dyn UploadStore>,
    storage: Arc<dyn UploadStorage>,
    lock: Arc<dyn DistributedLock>,
    producer: TaskProducer,
    users: Arc<dyn UserResolver>,
    lock_lease: Duration,
    lock_policy: RetryPolicy,
}

impl UploadOrchestrator {
    pub fn new(
        store: Arc<dyn UploadStore>,
        storage: Arc<dyn UploadStorage>,
        lock: Arc<dyn DistributedLock>,
        producer: TaskProducer,
        users: Arc<dyn UserResolver>,
        lock_lease: Duration,
    ) -> Self {
        Self {
            store,
            storage,
            lock,
            producer,
            users,
            lock_lease,
            lock_policy: RetryPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, policy: RetryPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    async fn load_owned(&self, upload_id: &str, user_id: i64) -> Result<Upload, AppError> {
        let upload = self
            .store
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("upload {upload_id} not found")))?;
        if !upload.is_owned_by(user_id) {
            return Err(AppError::Forbidden(format!(
                "upload {upload_id} belongs to another user"
            )));
        }
        Ok(upload)
    }

    /// Hand a fully transferred upload to processing.
    ///
    /// Only one caller per upload gets past the lock and the status check;
    /// the others see `Conflict`.
    #[tracing::instrument(skip(self, request), fields(upload_id = %upload_id, user_id = user_id))]
    pub async fn notify(
        &self,
        upload_id: &str,
        user_id: i64,
        request: RpcRequest,
    ) -> Result<(), AppError> {
        self.load_owned(upload_id, user_id).await?;

        let guard = self
            .lock
            .acquire(&lock_key(upload_id), self.lock_lease, self.lock_policy)
            .await?;
        let result = self.notify_locked(upload_id, user_id, request).await;
        match self.lock.release(&guard).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Upload lock expired before notify finished"),
            Err(e) => tracing::warn!(error = %e, "Failed to release upload lock"),
        }
        result
    }

    async fn notify_locked(
        &self,
        upload_id: &str,
        user_id: i64,
        request: RpcRequest,
    ) -> Result<(), AppError> {
        let upload = self.load_owned(upload_id, user_id).await?;
        if !upload.status.is_transferring() {
            return Err(AppError::Conflict(format!(
                "upload {upload_id} is already {}",
                upload.status
            )));
        }

        let info = self.storage.info(upload_id).await?;
        if !info.is_complete() {
            return Err(AppError::Conflict(format!(
                "upload {upload_id} is incomplete: {} of {} bytes received",
                info.offset, info.size
            )));
        }

        let filename = if upload.filename.is_empty() {
            info.metadata
                .get("filename")
                .or_else(|| info.metadata.get("name"))
                .cloned()
                .unwrap_or_else(|| upload_id.to_string())
        } else {
            upload.filename.clone()
        };
        let path = self.storage.finalize(upload_id, user_id, &filename).await?;

        let query = Query::new(upload_id, request.clone());
        if let Err(e) = self.store.mark_received(upload_id, &path, &query).await {
            // The file has left the protocol handler's directory, so a later
            // notify cannot find it again. Fail the upload and keep the path.
            let error = format!("failed to record finalized upload at {path}: {e}");
            if let Err(mark_err) = self.store.mark_failed(upload_id, &error).await {
                tracing::error!(error = %mark_err, path = %path, "Failed to record finalize failure");
            }
            return Err(e);
        }

        let payload = UploadProcessPayload {
            upload_id: upload_id.to_string(),
            path,
            user_id,
            request,
        };
        let opts = TaskOptions::default()
            .max_retry(PROCESS_MAX_RETRY)
            .timeout(PROCESS_TIMEOUT)
            .retention(PROCESS_RETENTION)
            .task_id(upload_id);
        if let Err(e) = self.producer.put_payload(&payload, opts).await {
            let error = format!("failed to enqueue processing: {e}");
            if let Err(mark_err) = self.store.mark_failed(upload_id, &error).await {
                tracing::error!(error = %mark_err, "Failed to record enqueue failure");
            }
            return Err(AppError::Broker(error));
        }

        tracing::info!(filename = %filename, "Upload received, processing scheduled");
        Ok(())
    }

    pub async fn get_status(&self, upload_id: &str, user_id: i64) -> Result<PublishStatus, AppError> {
        let upload = self.load_owned(upload_id, user_id).await?;
        let query = self.store.get_query(upload_id).await?;
        Ok(PublishStatus::from_records(&upload, query.as_ref()))
    }

    async fn apply_hook(&self, event: &HookEvent, user_id: i64) -> Result<(), AppError> {
        let id = event.upload.id.as_str();
        let applied = match event.kind {
            HookKind::Created => {
                let upload = Upload::new(
                    id,
                    user_id,
                    event.upload.size,
                    event.upload.filename().unwrap_or_default(),
                );
                self.store.create_upload(&upload).await?
            }
            HookKind::Progress => self.store.record_progress(id, event.upload.offset).await?,
            HookKind::CompleteUploads => self.store.mark_transferred(id).await?,
            HookKind::Terminated => self.store.mark_terminated(id).await?,
        };
        if !applied {
            tracing::debug!(upload_id = %id, hook = %event.kind, "Hook did not change the upload");
        }
        Ok(())
    }
}

#[async_trait]
impl HookListener for UploadOrchestrator {
    async fn on_hook(&self, event: HookEvent) {
        let user_id = match self.users.resolve(&header_map(&event.headers)) {
            Ok(user_id) => user_id,
            Err(e) => {
                tracing::warn!(
                    upload_id = %event.upload.id,
                    hook = %event.kind,
                    error = %e,
                    "Dropping hook event: user could not be resolved"
                );
                return;
            }
        };
        if let Err(e) = self.apply_hook(&event, user_id).await {
            tracing::error!(
                upload_id = %event.upload.id,
                hook = %event.kind,
                error = %e,
                "Failed to apply hook event"
            );
        }
    }
}
