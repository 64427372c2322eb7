use sha2::{Digest, Sha384};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::manifest::{hash_bytes, ChunkRef, Manifest, MANIFEST_VERSION, MAX_CHUNK_SIZE};
use crate::keys;
use crate::traits::{StorageError, StorageResult};

/// A split file: its manifest and the local directory holding its blobs.
#[derive(Debug, Clone)]
pub struct Stream {
    pub manifest: Manifest,
    pub sd_hash: String,
    /// `<destination_dir>/<sd_hash>`, containing every chunk and the manifest.
    pub dir: PathBuf,
}

impl Stream {
    pub fn file_hash(&self) -> &str {
        &self.manifest.file_hash
    }

    /// Every blob of the stream, chunks first and the manifest last.
    pub fn blob_hashes(&self) -> Vec<String> {
        self.manifest
            .chunk_hashes()
            .map(str::to_string)
            .chain(std::iter::once(self.sd_hash.clone()))
            .collect()
    }

    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    /// Remove the local blob directory. Already gone is fine.
    pub async fn remove_local(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fill `buf` from `reader`; short only at end of input.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn has_len(path: &Path, len: u64) -> bool {
    matches!(fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() == len)
}

/// Split `source` into content-addressed chunks under
/// `destination_dir/<sd_hash>/`.
///
/// Chunks are staged in a working directory and moved into place once the
/// `sd_hash` is known. If the final directory already exists from an earlier
/// attempt, chunk files that are present with the right length are kept.
/// On error the staging directory is removed; a directory reused from an
/// earlier attempt is left as it was.
#[tracing::instrument(skip_all, fields(source = %source.display()))]
pub async fn split(source: &Path, destination_dir: &Path) -> StorageResult<Stream> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StorageError::InvalidKey(format!("no file name: {}", source.display())))?;

    let mut file = fs::File::open(source).await.map_err(|e| {
        StorageError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to open {}: {}", source.display(), e),
        ))
    })?;

    fs::create_dir_all(destination_dir).await?;
    let staging = destination_dir.join(format!(".staging-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&staging).await?;

    let result = split_staged(&mut file, name, &staging, destination_dir).await;
    if result.is_err() {
        match fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(error = %e, staging = %staging.display(), "Failed to remove staging directory")
            }
        }
    }
    result
}

async fn split_staged(
    file: &mut fs::File,
    name: String,
    staging: &Path,
    destination_dir: &Path,
) -> StorageResult<Stream> {
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    let mut whole = Sha384::new();
    let mut chunks = Vec::new();
    let mut size = 0u64;

    loop {
        let n = read_chunk(file, &mut buf).await?;
        if n == 0 {
            break;
        }
        let data = &buf[..n];
        whole.update(data);
        let hash = hash_bytes(data);
        let chunk_path = staging.join(&hash);
        if !has_len(&chunk_path, n as u64).await {
            fs::write(&chunk_path, data).await?;
        }
        chunks.push(ChunkRef {
            index: chunks.len() as u32,
            hash,
            length: n as u64,
        });
        size += n as u64;
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        name,
        size,
        file_hash: hex::encode(whole.finalize()),
        chunks,
    };
    let manifest_bytes = manifest.to_bytes()?;
    let sd_hash = hash_bytes(&manifest_bytes);
    keys::validate_hash(&sd_hash)?;
    fs::write(staging.join(&sd_hash), &manifest_bytes).await?;

    let dir = destination_dir.join(&sd_hash);
    if fs::try_exists(&dir).await.unwrap_or(false) {
        let mut reused = 0usize;
        let mut entries = fs::read_dir(staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dir.join(entry.file_name());
            let len = entry.metadata().await?.len();
            if has_len(&target, len).await {
                reused += 1;
                continue;
            }
            fs::rename(entry.path(), &target).await?;
        }
        fs::remove_dir_all(staging).await?;
        tracing::debug!(sd_hash = %sd_hash, reused, "Reused existing blob directory");
    } else {
        fs::rename(staging, &dir).await?;
    }

    tracing::info!(
        sd_hash = %sd_hash,
        size_bytes = manifest.size,
        chunks = manifest.chunks.len(),
        "File split into blobs"
    );

    Ok(Stream {
        manifest,
        sd_hash,
        dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn empty_file_has_no_chunks() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("empty.bin");
        fs::write(&source, b"").await.unwrap();

        let stream = split(&source, &tmp.path().join("blobs")).await.unwrap();
        assert!(stream.manifest.chunks.is_empty());
        assert_eq!(stream.manifest.size, 0);
        assert_eq!(stream.file_hash(), hash_bytes(b""));
        assert_eq!(stream.blob_hashes(), vec![stream.sd_hash.clone()]);
        assert!(stream.blob_path(&stream.sd_hash).exists());
    }

    #[tokio::test]
    async fn last_chunk_is_short() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("big.bin");
        let data: Vec<u8> = (0..MAX_CHUNK_SIZE + 10).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &data).await.unwrap();

        let stream = split(&source, &tmp.path().join("blobs")).await.unwrap();
        let lengths: Vec<u64> = stream.manifest.chunks.iter().map(|c| c.length).collect();
        assert_eq!(lengths, vec![MAX_CHUNK_SIZE as u64, 10]);
        assert_eq!(stream.manifest.size, data.len() as u64);
        assert_eq!(stream.file_hash(), hash_bytes(&data));
        for chunk in &stream.manifest.chunks {
            let on_disk = fs::read(stream.blob_path(&chunk.hash)).await.unwrap();
            assert_eq!(hash_bytes(&on_disk), chunk.hash);
        }
    }

    #[tokio::test]
    async fn resplit_reuses_existing_directory() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("dummy.md");
        fs::write(&source, b"some text").await.unwrap();
        let dest = tmp.path().join("blobs");

        let first = split(&source, &dest).await.unwrap();
        let second = split(&source, &dest).await.unwrap();
        assert_eq!(first.sd_hash, second.sd_hash);
        assert_eq!(first.dir, second.dir);

        let mut entries = fs::read_dir(&dest).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![first.sd_hash.clone()]);

        second.remove_local().await.unwrap();
        assert!(!second.dir.exists());
        second.remove_local().await.unwrap();
    }

    #[tokio::test]
    async fn missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        let err = split(&tmp.path().join("nope"), tmp.path()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn failed_read_leaves_no_staging_directory() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("not-a-file");
        fs::create_dir(&source).await.unwrap();
        let dest = tmp.path().join("blobs");

        assert!(split(&source, &dest).await.is_err());
        let mut entries = fs::read_dir(&dest).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }
}
