//! Mediapub Infrastructure Library
//!
//! Shared infrastructure used by the API and the task handlers:
//! - Telemetry initialization
//! - Distributed locking (Redis, in-memory)
//! - HTTP error body

pub mod error;
pub mod lock;
pub mod telemetry;

// Re-export commonly used types
pub use error::ErrorResponse;
pub use lock::{DistributedLock, LockError, LockGuard, LockResult, MemoryLock, RedisLock, RetryPolicy};
pub use telemetry::init_telemetry;
