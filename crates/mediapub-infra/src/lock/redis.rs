use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

use super::{DistributedLock, LockError, LockGuard, LockResult};

// Delete only while the stored token is ours.
const LUA_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Lock stored as `SET <prefix>:<key> <token> NX PX <lease>`.
#[derive(Clone)]
pub struct RedisLock {
    conn: ConnectionManager,
    key_prefix: String,
}

impl std::fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLock")
            .field("connection", &"ConnectionManager")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisLock {
    pub async fn new(url: &str) -> LockResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key_prefix: "mediapub:lock".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

/// `PX` argument for a lease: whole milliseconds, at least one.
fn lease_millis(lease: Duration) -> LockResult<u64> {
    u64::try_from(lease.as_millis())
        .map(|ms| ms.max(1))
        .map_err(|_| LockError::Backend {
            message: format!("lease too long: {lease:?}"),
            source: None,
        })
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, lease: Duration) -> LockResult<Option<LockGuard>> {
        let lease_ms = lease_millis(lease)?;
        let guard = LockGuard::new(key);
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(guard.token())
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(reply.map(|_| guard))
    }

    async fn release(&self, guard: &LockGuard) -> LockResult<bool> {
        let deleted: i64 = Script::new(LUA_RELEASE)
            .key(self.redis_key(guard.key()))
            .arg(guard.token())
            .invoke_async(&mut self.conn.clone())
            .await?;
        if deleted == 0 {
            tracing::warn!(lock_key = %guard.key(), "Lock lease expired before release");
        }
        Ok(deleted == 1)
    }
}
