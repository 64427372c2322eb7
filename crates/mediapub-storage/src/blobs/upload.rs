use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::fs;

use super::index::BlobIndex;
use super::split::Stream;
use crate::traits::{BlobStore, StorageError, StorageResult};

/// Blobs transferred concurrently per destination.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 8;

/// Outcome of uploading one stream to every destination. Counts are per
/// `(destination, blob)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub uploaded: usize,
    pub already_present: usize,
    pub failed: usize,
    /// Bytes sent over the wire.
    pub bytes: u64,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.uploaded + self.already_present + self.failed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    fn add(&mut self, outcome: BlobOutcome) {
        match outcome {
            BlobOutcome::Uploaded(bytes) => {
                self.uploaded += 1;
                self.bytes += bytes;
            }
            BlobOutcome::Present => self.already_present += 1,
            BlobOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BlobOutcome {
    Uploaded(u64),
    Present,
    Failed,
}

/// Uploads split streams to every configured destination, skipping blobs the
/// index or the destination already has.
#[derive(Clone)]
pub struct Uploader {
    destinations: Vec<Arc<dyn BlobStore>>,
    index: Arc<dyn BlobIndex>,
    concurrency: usize,
}

impl Uploader {
    pub fn new(destinations: Vec<Arc<dyn BlobStore>>, index: Arc<dyn BlobIndex>) -> Self {
        Self {
            destinations,
            index,
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn destination_names(&self) -> Vec<String> {
        self.destinations.iter().map(|d| d.name().to_string()).collect()
    }

    /// Upload every blob of `stream`.
    ///
    /// Individual blob failures are counted in the summary. `Err` means the
    /// upload could not be attempted at all. The manifest blob goes to a
    /// destination only after all of the stream's chunks are there.
    #[tracing::instrument(skip_all, fields(sd_hash = %stream.sd_hash))]
    pub async fn upload(&self, stream: &Stream) -> StorageResult<Summary> {
        if self.destinations.is_empty() {
            return Err(StorageError::ConfigError(
                "no blob destinations configured".to_string(),
            ));
        }
        let meta = fs::metadata(&stream.dir).await.map_err(|e| {
            StorageError::IoError(std::io::Error::new(
                e.kind(),
                format!("blob directory {} unreadable: {}", stream.dir.display(), e),
            ))
        })?;
        if !meta.is_dir() {
            return Err(StorageError::BackendError(format!(
                "blob directory {} is not a directory",
                stream.dir.display()
            )));
        }

        let chunk_hashes: Vec<&str> = stream.manifest.chunk_hashes().collect();
        let mut summary = Summary::default();

        for destination in &self.destinations {
            let uploads: Vec<_> = chunk_hashes
                .iter()
                .map(|hash| self.upload_blob(destination.as_ref(), stream, hash))
                .collect();
            let outcomes: Vec<BlobOutcome> = futures::stream::iter(uploads)
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            let chunk_failures = outcomes
                .iter()
                .filter(|o| matches!(o, BlobOutcome::Failed))
                .count();
            for outcome in outcomes {
                summary.add(outcome);
            }

            if chunk_failures > 0 {
                tracing::warn!(
                    destination = %destination.name(),
                    failed_chunks = chunk_failures,
                    "Withholding manifest from destination with missing chunks"
                );
                summary.add(BlobOutcome::Failed);
                continue;
            }
            summary.add(
                self.upload_blob(destination.as_ref(), stream, &stream.sd_hash)
                    .await,
            );
        }

        if summary.has_failures() {
            tracing::warn!(
                uploaded = summary.uploaded,
                already_present = summary.already_present,
                failed = summary.failed,
                bytes = summary.bytes,
                "Stream upload incomplete"
            );
        } else {
            tracing::info!(
                uploaded = summary.uploaded,
                already_present = summary.already_present,
                bytes = summary.bytes,
                "Stream uploaded"
            );
        }
        Ok(summary)
    }

    async fn upload_blob(&self, destination: &dyn BlobStore, stream: &Stream, hash: &str) -> BlobOutcome {
        let name = destination.name();

        match self.index.contains(name, hash).await {
            Ok(true) => return BlobOutcome::Present,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, destination = %name, hash = %hash, "Blob index lookup failed")
            }
        }

        let path = stream.blob_path(hash);
        match destination.exists(hash).await {
            Ok(true) => {
                let size = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                self.record(name, hash, size).await;
                return BlobOutcome::Present;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, destination = %name, hash = %hash, "Blob existence check failed");
                return BlobOutcome::Failed;
            }
        }

        let data = match fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Failed to read local blob");
                return BlobOutcome::Failed;
            }
        };
        let size = data.len() as u64;

        match destination.put(hash, data).await {
            Ok(()) => {
                self.record(name, hash, size).await;
                BlobOutcome::Uploaded(size)
            }
            Err(e) => {
                tracing::warn!(error = %e, destination = %name, hash = %hash, "Blob upload failed");
                BlobOutcome::Failed
            }
        }
    }

    async fn record(&self, destination: &str, hash: &str, size: u64) {
        if let Err(e) = self.index.record(destination, hash, size).await {
            tracing::warn!(error = %e, destination = %destination, hash = %hash, "Failed to record blob in index");
        }
    }
}
