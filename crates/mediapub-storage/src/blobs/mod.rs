//! Content-addressed blob engine.
//!
//! A file is split into chunks of at most [`MAX_CHUNK_SIZE`] bytes, each
//! addressed by the lowercase hex SHA-384 of its content. The ordered chunk
//! list, the file name, size and whole-file digest form a [`Manifest`] that
//! is itself stored as a blob; its address is the stream's `sd_hash`.
//!
//! ```text
//! split(file, dir)        -> dir/<sd_hash>/{<chunk hash>..., <sd_hash>}
//! Uploader::upload(stream) -> every blob on every destination, deduplicated
//! fetch(store, sd_hash)    -> the original bytes, verified chunk by chunk
//! ```

mod fetch;
mod index;
mod manifest;
mod split;
mod upload;

pub use fetch::fetch;
pub use index::{BlobIndex, MemoryBlobIndex};
pub use manifest::{hash_bytes, ChunkRef, Manifest, MAX_CHUNK_SIZE, MANIFEST_VERSION};
pub use split::{split, Stream};
pub use upload::{Summary, Uploader, DEFAULT_UPLOAD_CONCURRENCY};
