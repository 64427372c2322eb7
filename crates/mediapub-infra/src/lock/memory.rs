use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{DistributedLock, LockGuard, LockResult};

/// Process-local lock with the same lease and token semantics as
/// [`RedisLock`](super::RedisLock).
#[derive(Debug, Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, lease: Duration) -> LockResult<Option<LockGuard>> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = held.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        let guard = LockGuard::new(key);
        held.insert(key.to_string(), (guard.token().to_string(), now + lease));
        Ok(Some(guard))
    }

    async fn release(&self, guard: &LockGuard) -> LockResult<bool> {
        let mut held = self.held.lock().await;
        match held.get(guard.key()) {
            Some((token, expires)) if token == guard.token() && *expires > Instant::now() => {
                held.remove(guard.key());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
