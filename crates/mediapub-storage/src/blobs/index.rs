use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::traits::StorageResult;

/// Which blobs each destination is known to hold.
///
/// The index is a cache of destination state: a miss is confirmed against the
/// destination before uploading, and a hit is trusted.
#[async_trait]
pub trait BlobIndex: Send + Sync {
    async fn contains(&self, destination: &str, hash: &str) -> StorageResult<bool>;

    async fn record(&self, destination: &str, hash: &str, size: u64) -> StorageResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobIndex {
    entries: RwLock<HashMap<(String, String), u64>>,
}

impl MemoryBlobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl BlobIndex for MemoryBlobIndex {
    async fn contains(&self, destination: &str, hash: &str) -> StorageResult<bool> {
        Ok(self
            .entries
            .read()
            .await
            .contains_key(&(destination.to_string(), hash.to_string())))
    }

    async fn record(&self, destination: &str, hash: &str, size: u64) -> StorageResult<()> {
        self.entries
            .write()
            .await
            .insert((destination.to_string(), hash.to_string()), size);
        Ok(())
    }
}
