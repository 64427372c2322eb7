use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::keys;
use crate::traits::{StorageError, StorageResult};

/// Largest chunk: one byte under the 2 MiB blob limit of the store.
pub const MAX_CHUNK_SIZE: usize = 2 * 1024 * 1024 - 1;

pub const MANIFEST_VERSION: u32 = 1;

/// Lowercase hex SHA-384.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha384::digest(data))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub index: u32,
    pub hash: String,
    pub length: u64,
}

/// Stream descriptor.
///
/// Field order is the serialisation order, so [`Manifest::to_bytes`] is
/// canonical and two splits of the same content agree on the `sd_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub name: String,
    pub size: u64,
    /// SHA-384 of the whole file.
    pub file_hash: String,
    pub chunks: Vec<ChunkRef>,
}

impl Manifest {
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StorageError::InvalidManifest(e.to_string()))
    }

    pub fn from_bytes(raw: &[u8]) -> StorageResult<Self> {
        let manifest: Manifest = serde_json::from_slice(raw)
            .map_err(|e| StorageError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn sd_hash(&self) -> StorageResult<String> {
        Ok(hash_bytes(&self.to_bytes()?))
    }

    pub fn chunk_hashes(&self) -> impl Iterator<Item = &str> {
        self.chunks.iter().map(|c| c.hash.as_str())
    }

    /// Sizes add up, indices are dense, addresses are well formed.
    pub fn validate(&self) -> StorageResult<()> {
        if self.version != MANIFEST_VERSION {
            return Err(StorageError::InvalidManifest(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        if !keys::is_valid_hash(&self.file_hash) {
            return Err(StorageError::InvalidManifest("bad file hash".to_string()));
        }
        let mut total = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != i {
                return Err(StorageError::InvalidManifest(format!(
                    "chunk {} out of order",
                    chunk.index
                )));
            }
            if !keys::is_valid_hash(&chunk.hash)
                || chunk.length == 0
                || chunk.length > MAX_CHUNK_SIZE as u64
            {
                return Err(StorageError::InvalidManifest(format!(
                    "bad chunk {}",
                    chunk.index
                )));
            }
            total += chunk.length;
        }
        if total != self.size {
            return Err(StorageError::InvalidManifest(format!(
                "chunks add up to {} bytes, manifest declares {}",
                total, self.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let data = b"hello";
        Manifest {
            version: MANIFEST_VERSION,
            name: "hello.txt".to_string(),
            size: 5,
            file_hash: hash_bytes(data),
            chunks: vec![ChunkRef {
                index: 0,
                hash: hash_bytes(data),
                length: 5,
            }],
        }
    }

    #[test]
    fn sha384_of_empty_input() {
        assert_eq!(
            hash_bytes(b""),
            "38b060a751ac96384cd9327eb1b1e36a21fdb71114be07434c0cc7bf63f6e1da274edebfe76f65fbd51ad2f14898b95b"
        );
    }

    #[test]
    fn sd_hash_is_stable_across_encodings() {
        let manifest = sample();
        let decoded = Manifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.sd_hash().unwrap(), manifest.sd_hash().unwrap());
    }

    #[test]
    fn rejects_inconsistent_size() {
        let mut manifest = sample();
        manifest.size = 6;
        let raw = manifest.to_bytes().unwrap();
        assert!(matches!(
            Manifest::from_bytes(&raw),
            Err(StorageError::InvalidManifest(_))
        ));
    }
}
