use sha2::{Digest, Sha384};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::manifest::{hash_bytes, Manifest};
use crate::traits::{BlobStore, StorageError, StorageResult};

/// Reassemble the stream `sd_hash` from `store` into `output`, checking every
/// chunk and the whole file against the manifest.
pub async fn fetch(store: &dyn BlobStore, sd_hash: &str, output: &Path) -> StorageResult<Manifest> {
    let raw = store.get(sd_hash).await?;
    if hash_bytes(&raw) != sd_hash {
        return Err(StorageError::InvalidManifest(format!(
            "descriptor {sd_hash} does not match its content"
        )));
    }
    let manifest = Manifest::from_bytes(&raw)?;

    let mut file = fs::File::create(output).await?;
    let mut whole = Sha384::new();
    for chunk in &manifest.chunks {
        let data = store.get(&chunk.hash).await?;
        if data.len() as u64 != chunk.length || hash_bytes(&data) != chunk.hash {
            return Err(StorageError::DownloadFailed(format!(
                "chunk {} of {} is corrupt",
                chunk.index, sd_hash
            )));
        }
        whole.update(&data);
        file.write_all(&data).await?;
    }
    file.flush().await?;

    if hex::encode(whole.finalize()) != manifest.file_hash {
        return Err(StorageError::DownloadFailed(format!(
            "reassembled {} does not match its file hash",
            sd_hash
        )));
    }
    Ok(manifest)
}
