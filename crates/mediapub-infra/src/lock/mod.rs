//! Distributed mutual exclusion keyed by resource ID.
//!
//! A lock is held under a lease so a crashed holder cannot wedge the resource.
//! Each acquisition carries a random token and release only deletes the lock
//! when the token still matches, so a holder whose lease expired never frees
//! someone else's lock.

mod memory;
mod redis;

pub use memory::MemoryLock;
pub use redis::RedisLock;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} unavailable after {attempts} attempts")]
    Unavailable { key: String, attempts: u32 },

    #[error("lock backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<::redis::RedisError> for LockError {
    fn from(err: ::redis::RedisError) -> Self {
        LockError::Backend {
            message: format!("Redis error: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

impl From<LockError> for mediapub_core::AppError {
    fn from(err: LockError) -> Self {
        mediapub_core::AppError::LockUnavailable(err.to_string())
    }
}

pub type LockResult<T> = Result<T, LockError>;

/// Proof of a held lock. Pass it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }
}

/// How hard [`DistributedLock::acquire`] tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(200),
        }
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock if it is free. `None` means another holder has it.
    async fn try_acquire(&self, key: &str, lease: Duration) -> LockResult<Option<LockGuard>>;

    /// Release a held lock. Returns `false` when the lease had already
    /// expired (or been taken over) and nothing was deleted.
    async fn release(&self, guard: &LockGuard) -> LockResult<bool>;

    /// Take the lock, retrying per `policy`.
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        policy: RetryPolicy,
    ) -> LockResult<LockGuard> {
        let attempts = policy.attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(guard) = self.try_acquire(key, lease).await? {
                tracing::debug!(lock_key = %key, attempt, "Lock acquired");
                return Ok(guard);
            }
            if attempt < attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        tracing::warn!(lock_key = %key, attempts, "Lock unavailable");
        Err(LockError::Unavailable {
            key: key.to_string(),
            attempts,
        })
    }
}
