use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use mediapub_storage::blobs::{fetch, MAX_CHUNK_SIZE};
use mediapub_storage::{
    split, BlobIndex, BlobStore, LocalBlobStore, MemoryBlobIndex, StorageError, StorageResult,
    Uploader,
};

/// Local store that refuses writes for selected hashes.
struct FlakyStore {
    inner: LocalBlobStore,
    failing: Mutex<HashSet<String>>,
    puts: AtomicUsize,
}

impl FlakyStore {
    async fn new(root: &std::path::Path) -> Self {
        Self {
            inner: LocalBlobStore::new("flaky", root).await.unwrap(),
            failing: Mutex::new(HashSet::new()),
            puts: AtomicUsize::new(0),
        }
    }

    fn fail_on(&self, hashes: impl IntoIterator<Item = String>) {
        self.failing.lock().unwrap().extend(hashes);
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, hash: &str, data: Bytes) -> StorageResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(hash) {
            return Err(StorageError::UploadFailed("injected failure".to_string()));
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

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

async fn write_source(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

#[tokio::test]
async fn second_upload_transfers_nothing() {
    let tmp = TempDir::new().unwrap();
    let source = write_source(&tmp, "video.mp4", &patterned(MAX_CHUNK_SIZE + 1234)).await;
    let store: Arc<dyn BlobStore> =
        Arc::new(LocalBlobStore::new("local:a", tmp.path().join("dest")).await.unwrap());
    let uploader = Uploader::new(vec![store], Arc::new(MemoryBlobIndex::new()));

    let stream = split(&source, &tmp.path().join("work")).await.unwrap();
    let first = uploader.upload(&stream).await.unwrap();
    assert_eq!(first.uploaded, 3);
    assert_eq!(first.failed, 0);
    assert_eq!(
        first.bytes,
        stream.manifest.size + std::fs::metadata(stream.blob_path(&stream.sd_hash)).unwrap().len()
    );

    let again = split(&source, &tmp.path().join("work")).await.unwrap();
    let second = uploader.upload(&again).await.unwrap();
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.bytes, 0);
    assert_eq!(second.already_present, 3);
}

#[tokio::test]
async fn identical_content_yields_identical_manifest() {
    let tmp = TempDir::new().unwrap();
    let data = patterned(4096);
    let a = write_source(&tmp, "same.bin", &data).await;
    let other = TempDir::new().unwrap();
    let b = write_source(&other, "same.bin", &data).await;

    let first = split(&a, &tmp.path().join("w1")).await.unwrap();
    let second = split(&b, &other.path().join("w2")).await.unwrap();
    assert_eq!(first.manifest, second.manifest);
    assert_eq!(first.sd_hash, second.sd_hash);
}

#[tokio::test]
async fn partial_failure_is_counted_and_retry_sends_only_missing() {
    let tmp = TempDir::new().unwrap();
    let source = write_source(&tmp, "big.bin", &patterned(2 * MAX_CHUNK_SIZE + 77)).await;
    let flaky = Arc::new(FlakyStore::new(&tmp.path().join("dest")).await);
    let uploader = Uploader::new(
        vec![flaky.clone() as Arc<dyn BlobStore>],
        Arc::new(MemoryBlobIndex::new()),
    );

    let stream = split(&source, &tmp.path().join("work")).await.unwrap();
    assert_eq!(stream.manifest.chunks.len(), 3);
    flaky.fail_on([stream.manifest.chunks[1].hash.clone()]);

    let summary = uploader.upload(&stream).await.unwrap();
    assert_eq!(summary.uploaded, 2);
    // One failed chunk plus the withheld manifest.
    assert_eq!(summary.failed, 2);
    assert!(!flaky.exists(&stream.sd_hash).await.unwrap());

    flaky.heal();
    let before = flaky.puts.load(Ordering::SeqCst);
    let retry = uploader.upload(&stream).await.unwrap();
    assert_eq!(retry.failed, 0);
    assert_eq!(retry.uploaded, 2);
    assert_eq!(retry.already_present, 2);
    assert_eq!(flaky.puts.load(Ordering::SeqCst) - before, 2);

    let restored = tmp.path().join("restored.bin");
    let manifest = fetch(flaky.as_ref(), &stream.sd_hash, &restored).await.unwrap();
    assert_eq!(manifest.name, "big.bin");
    assert_eq!(
        tokio::fs::read(&restored).await.unwrap(),
        tokio::fs::read(&source).await.unwrap()
    );
}

#[tokio::test]
async fn store_hits_backfill_the_index() {
    let tmp = TempDir::new().unwrap();
    let source = write_source(&tmp, "a.txt", b"content addressed").await;
    let store: Arc<dyn BlobStore> =
        Arc::new(LocalBlobStore::new("local:b", tmp.path().join("dest")).await.unwrap());
    let stream = split(&source, &tmp.path().join("work")).await.unwrap();

    Uploader::new(vec![store.clone()], Arc::new(MemoryBlobIndex::new()))
        .upload(&stream)
        .await
        .unwrap();

    let fresh_index = Arc::new(MemoryBlobIndex::new());
    let summary = Uploader::new(vec![store], fresh_index.clone())
        .upload(&stream)
        .await
        .unwrap();
    assert_eq!(summary.already_present, 2);
    assert!(fresh_index.contains("local:b", &stream.sd_hash).await.unwrap());
    assert_eq!(fresh_index.len().await, 2);
}

#[tokio::test]
async fn each_destination_is_accounted_separately() {
    let tmp = TempDir::new().unwrap();
    let source = write_source(&tmp, "a.txt", b"two destinations").await;
    let healthy: Arc<dyn BlobStore> =
        Arc::new(LocalBlobStore::new("local:ok", tmp.path().join("ok")).await.unwrap());
    let flaky = Arc::new(FlakyStore::new(&tmp.path().join("flaky")).await);
    let stream = split(&source, &tmp.path().join("work")).await.unwrap();
    flaky.fail_on(stream.blob_hashes());

    let summary = Uploader::new(
        vec![healthy.clone(), flaky.clone() as Arc<dyn BlobStore>],
        Arc::new(MemoryBlobIndex::new()),
    )
    .upload(&stream)
    .await
    .unwrap();

    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.failed, 2);
    assert!(healthy.exists(&stream.sd_hash).await.unwrap());
}

#[tokio::test]
async fn hard_errors_when_upload_cannot_start() {
    let tmp = TempDir::new().unwrap();
    let source = write_source(&tmp, "a.txt", b"x").await;
    let stream = split(&source, &tmp.path().join("work")).await.unwrap();

    let none = Uploader::new(Vec::new(), Arc::new(MemoryBlobIndex::new()));
    assert!(matches!(
        none.upload(&stream).await,
        Err(StorageError::ConfigError(_))
    ));

    let store: Arc<dyn BlobStore> =
        Arc::new(LocalBlobStore::new("local:c", tmp.path().join("dest")).await.unwrap());
    stream.remove_local().await.unwrap();
    let err = Uploader::new(vec![store], Arc::new(MemoryBlobIndex::new()))
        .upload(&stream)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
