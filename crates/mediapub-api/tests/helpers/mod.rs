//! Test helpers: assemble the application on in-memory backends.
//!
//! Nothing here needs Postgres or Redis: records live in
//! `MemoryUploadStore`, tasks in `MemoryBroker`, locks in `MemoryLock`, and
//! uploads and blobs in temporary directories.

#![allow(dead_code)]

use async_trait::async_trait;
use axum_test::TestServer;
use bytes::Bytes;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use mediapub_api::auth::{JwtClaims, JwtUserResolver};
use mediapub_api::rpc::{RpcClient, RpcError};
use mediapub_api::task_handlers::ResultSink;
use mediapub_api::{assemble, Application, Components};
use mediapub_core::models::{
    Query, QueryStatus, RpcRequest, RpcResponse, Upload, UploadProcessResult, UploadStatus,
};
use mediapub_core::{AppError, Config};
use mediapub_db::{MemoryUploadStore, UploadStore};
use mediapub_infra::MemoryLock;
use mediapub_storage::{
    BlobStore, LocalBlobStore, LocalUploadStorage, MemoryBlobIndex, StorageError, StorageResult,
};
use mediapub_worker::MemoryBroker;

pub const JWT_SECRET: &str = "test-jwt-secret-with-at-least-32-characters";

pub fn token(user_id: i64) -> String {
    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as usize
        + 3600;
    encode(
        &Header::new(Algorithm::HS256),
        &JwtClaims {
            sub: user_id.to_string(),
            exp,
        },
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn bearer(user_id: i64) -> String {
    format!("Bearer {}", token(user_id))
}

pub fn test_config(root: &Path) -> Config {
    let vars: HashMap<&str, String> = HashMap::from([
        ("DATABASE_URL", "postgres://unused/mediapub".to_string()),
        ("JWT_SECRET", JWT_SECRET.to_string()),
        ("UPLOADS_DIR", root.join("uploads").display().to_string()),
        ("BLOBS_DIR", root.join("blobs").display().to_string()),
        ("FFPROBE_PATH", "/nonexistent/ffprobe".to_string()),
        ("LOCK_LEASE_SECONDS", "100".to_string()),
        ("TASK_BUS_POLL_INTERVAL_MS", "20".to_string()),
        ("TASK_BUS_STATS_INTERVAL_SECS", "0".to_string()),
        ("TASK_BUS_SHUTDOWN_GRACE_SECS", "1".to_string()),
    ]);
    Config::from_vars(|key| vars.get(key).cloned()).unwrap()
}

/// Downstream service stand-in: echoes the method and params it was called with.
#[derive(Default)]
pub struct EchoRpc {
    pub calls: Mutex<Vec<(i64, RpcRequest)>>,
    /// When set, every call answers with this JSON-RPC error.
    pub fail_with: Option<String>,
}

#[async_trait]
impl RpcClient for EchoRpc {
    async fn call(&self, user_id: i64, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        self.calls.lock().unwrap().push((user_id, request.clone()));
        Ok(match &self.fail_with {
            Some(message) => RpcResponse::failure(request.id.clone(), -32000, message.clone()),
            None => RpcResponse::success(
                request.id.clone(),
                json!({ "method": request.method, "params": request.params }),
            ),
        })
    }
}

/// Local blob store whose next `failures` puts fail.
pub struct FlakyStore {
    inner: LocalBlobStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub async fn new(root: &Path, failures: usize) -> Self {
        Self {
            inner: LocalBlobStore::new("flaky", root).await.unwrap(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, hash: &str, data: Bytes) -> StorageResult<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::UploadFailed(format!("injected failure for {hash}")));
        }
        self.inner.put(hash, data).await
    }

    async fn exists(&self, hash: &str) -> StorageResult<bool> {
        self.inner.exists(hash).await
    }

    async fn get(&self, hash: &str) -> StorageResult<Bytes> {
        self.inner.get(hash).await
    }
}

/// Result sink that keeps every delivered result.
#[derive(Default)]
pub struct CapturingSink {
    pub results: Mutex<Vec<UploadProcessResult>>,
}

#[async_trait]
impl ResultSink for CapturingSink {
    async fn deliver(&self, result: &UploadProcessResult) -> anyhow::Result<()> {
        self.results.lock().unwrap().push(result.clone());
        Ok(())
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub app: Application,
    pub store: Arc<MemoryUploadStore>,
    pub broker: Arc<MemoryBroker>,
    pub rpc: Arc<EchoRpc>,
    pub uploads_dir: PathBuf,
    pub blobs_dir: PathBuf,
    pub _root: TempDir,
}

impl TestApp {
    /// Application with the task bus stopped; call [`TestApp::start_worker`] to run jobs.
    pub async fn new() -> Self {
        Self::with_rpc(EchoRpc::default()).await
    }

    pub async fn with_rpc(rpc: EchoRpc) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let uploads_dir = config.uploads_dir.clone();
        let blobs_dir = config.blobs_dir.clone();

        let store = Arc::new(MemoryUploadStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let rpc = Arc::new(rpc);
        let destination: Arc<dyn BlobStore> = Arc::new(
            LocalBlobStore::new("local:test", root.path().join("published"))
                .await
                .unwrap(),
        );

        let components = Components {
            store: store.clone(),
            upload_storage: Arc::new(LocalUploadStorage::new(&uploads_dir).await.unwrap()),
            lock: Arc::new(MemoryLock::new()),
            broker: broker.clone(),
            blob_destinations: vec![destination],
            blob_index: Arc::new(MemoryBlobIndex::new()),
            rpc: rpc.clone(),
            users: Arc::new(JwtUserResolver::new(JWT_SECRET)),
            direct_results: false,
        };
        let app = assemble(&config, components).unwrap();
        let server = TestServer::new(app.router.clone()).unwrap();

        Self {
            server,
            app,
            store,
            broker,
            rpc,
            uploads_dir,
            blobs_dir,
            _root: root,
        }
    }

    pub fn start_worker(&self) {
        let bus = self.app.bus.clone();
        tokio::spawn(async move { bus.start_handlers().await });
    }

    pub async fn write_upload(&self, id: &str, filename: &str, data: &[u8], size: i64) {
        write_filestore_upload(&self.uploads_dir, id, filename, data, size).await;
    }

    pub async fn send_hook(&self, hook: &str, id: &str, filename: &str, size: i64, offset: i64, user_id: i64) {
        let body = hook_body(hook, id, filename, size, offset, &bearer(user_id));
        let response = self.server.post("/api/v1/uploads/hooks").json(&body).await;
        assert_eq!(response.status_code(), 200);
    }

    /// Drive the hooks of a complete single-request upload.
    pub async fn upload(&self, id: &str, filename: &str, data: &[u8], user_id: i64) {
        let size = data.len() as i64;
        self.send_hook("post-create", id, filename, size, 0, user_id).await;
        wait_until(|| async { self.store_has(id).await }).await;

        self.write_upload(id, filename, data, size).await;
        self.send_hook("post-receive", id, filename, size, size, user_id).await;
        self.send_hook("post-finish", id, filename, size, size, user_id).await;
        wait_until(|| async {
            use mediapub_db::UploadStore;
            matches!(
                self.store.get_upload(id).await.unwrap(),
                Some(upload) if upload.received == size
            )
        })
        .await;
    }

    async fn store_has(&self, id: &str) -> bool {
        use mediapub_db::UploadStore;
        self.store.get_upload(id).await.unwrap().is_some()
    }
}

/// Lay the upload out the way the protocol handler's filestore does.
pub async fn write_filestore_upload(dir: &Path, id: &str, filename: &str, data: &[u8], size: i64) {
    tokio::fs::write(dir.join(id), data).await.unwrap();
    let info = json!({
        "ID": id,
        "Size": size,
        "Offset": data.len(),
        "MetaData": { "filename": filename },
        "Storage": { "Type": "filestore" },
    });
    tokio::fs::write(
        dir.join(format!("{id}.info")),
        serde_json::to_vec(&info).unwrap(),
    )
    .await
    .unwrap();
}

/// Memory store whose next `mark_received` fails.
#[derive(Default)]
pub struct FlakyUploadStore {
    pub inner: MemoryUploadStore,
    pub fail_mark_received: AtomicBool,
}

#[async_trait]
impl UploadStore for FlakyUploadStore {
    async fn create_upload(&self, upload: &Upload) -> Result<bool, AppError> {
        self.inner.create_upload(upload).await
    }

    async fn get_upload(&self, id: &str) -> Result<Option<Upload>, AppError> {
        self.inner.get_upload(id).await
    }

    async fn record_progress(&self, id: &str, received: i64) -> Result<bool, AppError> {
        self.inner.record_progress(id, received).await
    }

    async fn mark_transferred(&self, id: &str) -> Result<bool, AppError> {
        self.inner.mark_transferred(id).await
    }

    async fn mark_terminated(&self, id: &str) -> Result<bool, AppError> {
        self.inner.mark_terminated(id).await
    }

    async fn mark_received(&self, id: &str, path: &str, query: &Query) -> Result<(), AppError> {
        if self.fail_mark_received.swap(false, Ordering::SeqCst) {
            return Err(AppError::Internal("db blip".to_string()));
        }
        self.inner.mark_received(id, path, query).await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), AppError> {
        self.inner.mark_failed(id, error).await
    }

    async fn get_query(&self, upload_id: &str) -> Result<Option<Query>, AppError> {
        self.inner.get_query(upload_id).await
    }

    async fn complete_query(
        &self,
        upload_id: &str,
        status: QueryStatus,
        response: Option<&RpcResponse>,
        error: &str,
        upload_status: UploadStatus,
    ) -> Result<bool, AppError> {
        self.inner
            .complete_query(upload_id, status, response, error, upload_status)
            .await
    }
}

pub fn hook_body(
    hook: &str,
    id: &str,
    filename: &str,
    size: i64,
    offset: i64,
    authorization: &str,
) -> Value {
    json!({
        "Type": hook,
        "Event": {
            "Upload": {
                "ID": id,
                "Size": size,
                "Offset": offset,
                "MetaData": { "filename": filename },
            },
            "HTTPRequest": {
                "Method": "PATCH",
                "URI": format!("/files/{id}"),
                "Header": { "Authorization": [authorization] },
            },
        },
    })
}

pub fn publish_request() -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "stream_create",
        "params": { "name": "dummy", "bid": "0.01", "file_path": "__POST_FILE__" },
        "id": 0,
    })
}

/// Poll `check` every 20ms for up to 10s.
pub async fn wait_until<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 10s");
}
