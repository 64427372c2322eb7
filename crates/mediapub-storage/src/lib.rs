//! Mediapub Storage Library
//!
//! Two storage concerns live here:
//!
//! - **Upload storage**: where the resumable-upload protocol handler leaves
//!   finished uploads. [`UploadStorage`] finalises them under
//!   `<user_id>/<upload_id>/<filename>` and hands them to processing as a
//!   [`LocalFile`].
//! - **Blob storage**: content-addressed destinations ([`BlobStore`]) and the
//!   blob engine in [`blobs`] that splits a file into SHA-384 addressed chunks
//!   and uploads them with deduplication.
//!
//! Upload IDs, filenames and blob hashes are validated in the `keys` module so
//! that no backend ever builds a path outside its root.

pub mod blobs;
pub mod factory;
pub(crate) mod keys;
pub mod local;
pub mod s3;
pub mod traits;
pub(crate) mod tusd;

// Re-export commonly used types
pub use blobs::{
    split, BlobIndex, Manifest, MemoryBlobIndex, Stream, Summary, Uploader, MAX_CHUNK_SIZE,
};
pub use factory::{create_blob_stores, create_upload_storage};
pub use local::{LocalBlobStore, LocalUploadStorage};
pub use mediapub_core::StorageBackend;
pub use s3::{ObjectBlobStore, S3UploadStorage};
pub use traits::{BlobStore, LocalFile, StorageError, StorageResult, UploadInfo, UploadStorage};
