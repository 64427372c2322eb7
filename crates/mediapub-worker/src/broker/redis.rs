//! Redis broker.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:{queue}:t:{task_id}` | String | Task JSON |
//! | `{prefix}:{queue}:pending` | List | Ready task IDs, FIFO |
//! | `{prefix}:{queue}:scheduled` | Sorted Set | Delayed task IDs scored by run time (ms) |
//! | `{prefix}:{queue}:active` | Sorted Set | Claimed task IDs scored by lease deadline (ms) |
//! | `{prefix}:{queue}:completed` | Sorted Set | Archived IDs scored by expiry (ms) |
//! | `{prefix}:{queue}:failed` | Sorted Set | Archived IDs scored by expiry (ms) |
//!
//! Every state transition is a Lua script so a crash never leaves a task in
//! two sets. Archived task bodies carry a Redis TTL equal to their retention,
//! which is also what keeps an explicit task ID reserved.

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use mediapub_core::models::{Task, TaskStats, TaskStatus};

use super::{settle_expired, Broker, DEFAULT_LEASE_GRACE};
use crate::error::{BrokerError, BrokerResult};

/// KEYS[1] = task key, KEYS[2] = pending, KEYS[3] = scheduled.
/// ARGV[1] = task id, ARGV[2] = task JSON, ARGV[3] = process_at ms, ARGV[4] = now ms.
/// Returns 0 when the ID is taken, 1 otherwise.
const LUA_ENQUEUE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
if tonumber(ARGV[3]) > tonumber(ARGV[4]) then
    redis.call('ZADD', KEYS[3], tonumber(ARGV[3]), ARGV[1])
else
    redis.call('RPUSH', KEYS[2], ARGV[1])
end
return 1
"#;

/// KEYS[1] = pending, KEYS[2] = scheduled, KEYS[3] = active.
/// ARGV[1] = now ms, ARGV[2] = task key prefix, ARGV[3] = lease grace ms.
/// Returns the claimed task JSON, or nil. The stored status is rewritten to
/// `active` in place: the first `"status"` member is the task's own.
const LUA_DEQUEUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('RPUSH', KEYS[1], id)
end
while true do
    local id = redis.call('LPOP', KEYS[1])
    if not id then
        return false
    end
    local key = ARGV[2] .. id
    local data = redis.call('GET', key)
    if data then
        local task = cjson.decode(data)
        local lease = (tonumber(task['timeout_seconds']) or 0) * 1000 + tonumber(ARGV[3])
        redis.call('ZADD', KEYS[3], tonumber(ARGV[1]) + lease, id)
        local _, open = string.find(data, '"status":"', 1, true)
        if open then
            local close = string.find(data, '"', open + 1, true)
            data = string.sub(data, 1, open) .. 'active' .. string.sub(data, close)
            redis.call('SET', key, data)
        end
        return data
    end
end
"#;

/// KEYS[1] = task key, KEYS[2] = active, KEYS[3] = scheduled.
/// ARGV[1] = task id, ARGV[2] = task JSON, ARGV[3] = process_at ms.
const LUA_RETRY: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SET', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[3], tonumber(ARGV[3]), ARGV[1])
return 1
"#;

/// KEYS[1] = task key, KEYS[2] = active, KEYS[3] = completed or failed.
/// ARGV[1] = task id, ARGV[2] = task JSON, ARGV[3] = retention seconds,
/// ARGV[4] = expiry ms, ARGV[5] = now ms.
const LUA_ARCHIVE: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', ARGV[5])
if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
    redis.call('ZADD', KEYS[3], tonumber(ARGV[4]), ARGV[1])
else
    redis.call('DEL', KEYS[1])
end
return 1
"#;

/// KEYS[1] = task key, KEYS[2] = active, KEYS[3] = pending, KEYS[4] = failed.
/// ARGV[1] = task id, ARGV[2] = settled task JSON, ARGV[3] = now ms,
/// ARGV[4] = `requeue` or `fail`, ARGV[5] = retention seconds, ARGV[6] = expiry ms.
/// Returns 0 when the task is no longer an expired lease.
const LUA_SETTLE_EXPIRED: &str = r#"
local deadline = redis.call('ZSCORE', KEYS[2], ARGV[1])
if not deadline or tonumber(deadline) > tonumber(ARGV[3]) then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
if ARGV[4] == 'requeue' then
    redis.call('SET', KEYS[1], ARGV[2])
    redis.call('RPUSH', KEYS[3], ARGV[1])
    return 1
end
redis.call('ZREMRANGEBYSCORE', KEYS[4], '-inf', ARGV[3])
if tonumber(ARGV[5]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[5]))
    redis.call('ZADD', KEYS[4], tonumber(ARGV[6]), ARGV[1])
else
    redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Key names of one queue under a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    base: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}"),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.base, suffix)
    }

    fn task_prefix(&self) -> String {
        self.key("t:")
    }

    fn task(&self, id: &str) -> String {
        format!("{}{}", self.task_prefix(), id)
    }

    fn archive_set(&self, status: TaskStatus) -> String {
        match status {
            TaskStatus::Failed => self.key("failed"),
            _ => self.key("completed"),
        }
    }
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    keys: QueueKeys,
    queue: String,
    lease_grace: Duration,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("connection", &"ConnectionManager")
            .field("keys", &self.keys.base)
            .field("queue", &self.queue)
            .finish()
    }
}

impl RedisBroker {
    /// Connect to Redis at `url` and serve the named queue.
    pub async fn new(url: &str, queue: impl Into<String>) -> BrokerResult<Self> {
        let client = ::redis::Client::open(url).map_err(|e| BrokerError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        let queue = queue.into();
        tracing::info!(queue = %queue, "Connected task broker to Redis");
        Ok(Self {
            conn,
            keys: QueueKeys::new("mediapub", &queue),
            queue,
            lease_grace: DEFAULT_LEASE_GRACE,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys = QueueKeys::new(&prefix.into(), &self.queue);
        self
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    async fn archive(&self, task: &Task, status: TaskStatus, error: Option<&str>) -> BrokerResult<()> {
        let now = Utc::now();
        let mut stored = task.clone();
        stored.status = status;
        stored.completed_at = Some(now);
        if let Some(error) = error {
            stored.last_error = Some(error.to_string());
        }
        let data = serde_json::to_string(&stored)?;
        let expires_ms = now.timestamp_millis() + (task.retention_seconds as i64) * 1000;
        let target = self.keys.archive_set(status);

        let _: i64 = Script::new(LUA_ARCHIVE)
            .key(self.keys.task(&task.id))
            .key(self.keys.key("active"))
            .key(target)
            .arg(&task.id)
            .arg(data)
            .arg(task.retention_seconds)
            .arg(expires_ms)
            .arg(now.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, task: Task) -> BrokerResult<()> {
        let data = serde_json::to_string(&task)?;
        let inserted: i64 = Script::new(LUA_ENQUEUE)
            .key(self.keys.task(&task.id))
            .key(self.keys.key("pending"))
            .key(self.keys.key("scheduled"))
            .arg(&task.id)
            .arg(data)
            .arg(task.process_at.timestamp_millis())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await?;

        if inserted == 0 {
            return Err(BrokerError::TaskIdConflict(task.id));
        }
        Ok(())
    }

    async fn dequeue(&self) -> BrokerResult<Option<Task>> {
        let data: Option<String> = Script::new(LUA_DEQUEUE)
            .key(self.keys.key("pending"))
            .key(self.keys.key("scheduled"))
            .key(self.keys.key("active"))
            .arg(Utc::now().timestamp_millis())
            .arg(self.keys.task_prefix())
            .arg(self.lease_grace.as_millis() as i64)
            .invoke_async(&mut self.conn.clone())
            .await?;

        match data {
            Some(data) => {
                let mut task: Task = serde_json::from_str(&data)?;
                task.status = TaskStatus::Active;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, task: &Task) -> BrokerResult<()> {
        self.archive(task, TaskStatus::Completed, None).await
    }

    async fn retry(&self, task: &Task, error: &str, process_at: DateTime<Utc>) -> BrokerResult<()> {
        let mut stored = task.clone();
        stored.retried += 1;
        stored.last_error = Some(error.to_string());
        stored.status = TaskStatus::Scheduled;
        stored.process_at = process_at;
        let data = serde_json::to_string(&stored)?;

        let _: i64 = Script::new(LUA_RETRY)
            .key(self.keys.task(&task.id))
            .key(self.keys.key("active"))
            .key(self.keys.key("scheduled"))
            .arg(&task.id)
            .arg(data)
            .arg(process_at.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn fail(&self, task: &Task, error: &str) -> BrokerResult<()> {
        self.archive(task, TaskStatus::Failed, Some(error)).await
    }

    async fn get(&self, id: &str) -> BrokerResult<Option<Task>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(self.keys.task(id)).await?;
        data.map(|d| serde_json::from_str(&d).map_err(BrokerError::from))
            .transpose()
    }

    async fn stats(&self) -> BrokerResult<TaskStats> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let (pending, scheduled, active, completed, failed): (u64, u64, u64, u64, u64) =
            ::redis::pipe()
                .llen(self.keys.key("pending"))
                .zcard(self.keys.key("scheduled"))
                .zcard(self.keys.key("active"))
                .zcount(self.keys.key("completed"), now, "+inf")
                .zcount(self.keys.key("failed"), now, "+inf")
                .query_async(&mut conn)
                .await?;

        Ok(TaskStats {
            pending,
            scheduled,
            active,
            completed,
            failed,
        })
    }

    async fn recover_stale(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        let now_ms = now.timestamp_millis();
        let stale: Vec<String> = conn
            .zrangebyscore(self.keys.key("active"), "-inf", now_ms)
            .await?;

        let mut settled_count = 0;
        for id in stale {
            let data: Option<String> = conn.get(self.keys.task(&id)).await?;
            let Some(data) = data else {
                let _: i64 = conn.zrem(self.keys.key("active"), &id).await?;
                continue;
            };
            let task: Task = serde_json::from_str(&data)?;
            let settled = settle_expired(&task, now);
            let mode = if settled.status == TaskStatus::Pending {
                "requeue"
            } else {
                "fail"
            };

            let applied: i64 = Script::new(LUA_SETTLE_EXPIRED)
                .key(self.keys.task(&id))
                .key(self.keys.key("active"))
                .key(self.keys.key("pending"))
                .key(self.keys.key("failed"))
                .arg(&id)
                .arg(serde_json::to_string(&settled)?)
                .arg(now_ms)
                .arg(mode)
                .arg(task.retention_seconds)
                .arg(now_ms + (task.retention_seconds as i64) * 1000)
                .invoke_async(&mut conn)
                .await?;
            if applied == 1 {
                settled_count += 1;
                if mode == "fail" {
                    tracing::warn!(task_id = %id, "Task lease expired with no retries left");
                }
            }
        }
        Ok(settled_count)
    }

    async fn close(&self) -> BrokerResult<()> {
        tracing::debug!(queue = %self.queue, "Closing Redis task broker");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use mediapub_core::models::{TaskOptions, TaskType};
    use serde_json::json;

    #[test]
    fn key_schema() {
        let keys = QueueKeys::new("mediapub", "default");
        assert_eq!(keys.key("pending"), "mediapub:default:pending");
        assert_eq!(keys.key("active"), "mediapub:default:active");
        assert_eq!(keys.task("abc"), "mediapub:default:t:abc");
        assert!(keys.task("abc").starts_with(&keys.task_prefix()));
        assert_eq!(keys.archive_set(TaskStatus::Failed), "mediapub:default:failed");
        assert_eq!(
            keys.archive_set(TaskStatus::Completed),
            "mediapub:default:completed"
        );
    }

    #[test]
    fn stored_status_comes_before_payload() {
        let payload = json!({ "status": "pending", "request": { "status": "scheduled" } });
        let opts = TaskOptions::default().task_id("id-with-\"status\":\"quote");
        let task = Task::new(TaskType::from_static("test:noop"), payload, &opts);
        let data = serde_json::to_string(&task).unwrap();

        let status_at = data.find("\"status\":\"").unwrap();
        assert!(status_at < data.find("\"payload\"").unwrap());
        assert!(data[status_at..].starts_with("\"status\":\"pending\""));

        let stored: Task = serde_json::from_str(&data).unwrap();
        assert_eq!(stored, task);
    }
}
