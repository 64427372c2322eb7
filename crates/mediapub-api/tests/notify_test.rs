mod helpers;

use helpers::*;
use mediapub_api::auth::JwtUserResolver;
use mediapub_api::UploadOrchestrator;
use mediapub_core::models::{PublishStatus, RpcRequest, TaskType, Upload, UploadStatus};
use mediapub_core::AppError;
use mediapub_db::UploadStore;
use mediapub_infra::MemoryLock;
use mediapub_storage::LocalUploadStorage;
use mediapub_worker::{MemoryBroker, TaskProducer};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_notify_schedules_one_job() {
    let app = TestApp::new().await;
    app.upload("race", "dummy.md", b"# dummy\n\n", 7).await;

    let mut calls = Vec::new();
    for _ in 0..8 {
        let orchestrator = app.app.state.orchestrator.clone();
        calls.push(tokio::spawn(async move {
            let request = RpcRequest::new("stream_create", json!({ "name": "dummy" }));
            orchestrator.notify("race", 7, request).await
        }));
    }

    let mut accepted = 0;
    for call in calls {
        match call.await.unwrap() {
            Ok(()) => accepted += 1,
            Err(AppError::Conflict(_)) | Err(AppError::LockUnavailable(_)) => {}
            Err(other) => panic!("unexpected notify error: {other}"),
        }
    }
    assert_eq!(accepted, 1);

    let jobs: Vec<_> = app
        .broker
        .snapshot()
        .await
        .into_iter()
        .filter(|t| t.task_type == TaskType::UPLOAD_PROCESS)
        .collect();
    assert_eq!(jobs.len(), 1);

    let upload = app.store.get_upload("race").await.unwrap().unwrap();
    assert_eq!(upload.status, UploadStatus::Received);
    assert!(upload.path.ends_with("7/race/dummy.md"));
}

#[tokio::test]
async fn test_notify_falls_back_to_protocol_metadata_filename() {
    let app = TestApp::new().await;
    // Created without a filename; the protocol handler's metadata still has one.
    app.send_hook("post-create", "meta", "", 9, 0, 7).await;
    wait_until(|| async { app.store.get_upload("meta").await.unwrap().is_some() }).await;
    app.write_upload("meta", "notes.md", b"# dummy\n\n", 9).await;

    app.app
        .state
        .orchestrator
        .notify("meta", 7, RpcRequest::new("stream_create", json!({})))
        .await
        .unwrap();

    let upload = app.store.get_upload("meta").await.unwrap().unwrap();
    assert!(upload.path.ends_with("7/meta/notes.md"));
    assert!(!app.uploads_dir.join("meta.info").exists());
}

#[tokio::test]
async fn test_record_failure_after_finalize_fails_the_upload() {
    let root = tempfile::tempdir().unwrap();
    let uploads_dir = root.path().join("uploads");
    let store = Arc::new(FlakyUploadStore::default());
    let broker = Arc::new(MemoryBroker::new());
    let orchestrator = UploadOrchestrator::new(
        store.clone(),
        Arc::new(LocalUploadStorage::new(&uploads_dir).await.unwrap()),
        Arc::new(MemoryLock::new()),
        TaskProducer::new(broker.clone()),
        Arc::new(JwtUserResolver::new(JWT_SECRET)),
        Duration::from_secs(100),
    );

    let mut upload = Upload::new("u2", 7, 9, "dummy.md");
    upload.received = 9;
    store.create_upload(&upload).await.unwrap();
    write_filestore_upload(&uploads_dir, "u2", "dummy.md", b"# dummy\n\n", 9).await;
    store.fail_mark_received.store(true, Ordering::SeqCst);

    let request = RpcRequest::new("stream_create", json!({ "name": "dummy" }));
    let err = orchestrator.notify("u2", 7, request.clone()).await.unwrap_err();
    assert!(matches!(err, AppError::Internal(_)));
    assert!(broker.snapshot().await.is_empty());

    let upload = store.get_upload("u2").await.unwrap().unwrap();
    assert_eq!(upload.status, UploadStatus::Failed);
    assert!(uploads_dir.join("7/u2/dummy.md").exists());
    assert!(upload.error.contains("7/u2/dummy.md"));
    assert!(matches!(
        PublishStatus::from_records(&upload, None),
        PublishStatus::Failed { .. }
    ));

    // A second notify is told the upload is settled, not that it vanished.
    let err = orchestrator.notify("u2", 7, request).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}
