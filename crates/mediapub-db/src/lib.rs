//! Database repositories for upload orchestration
//!
//! [`UploadStore`] persists the Upload and Query records owned by the
//! orchestrator; [`PgUploadRepository`] backs it with PostgreSQL and
//! [`MemoryUploadStore`] keeps it in process for tests and single-node use.
//! [`PgBlobIndex`] is the blob engine's per-destination dedup index.

pub mod blob_index;
pub mod memory;
pub mod upload;

pub use blob_index::PgBlobIndex;
pub use memory::MemoryUploadStore;
pub use upload::{PgUploadRepository, UploadStore};
