//! Broker abstraction: durable storage and scheduling of tasks.
//!
//! A broker owns one queue. Tasks move through
//! `pending | scheduled -> active -> completed | failed`, and a failed attempt
//! with budget left goes back to `scheduled`. Completed and failed tasks stay
//! readable until their retention elapses, which is also the window in which
//! an explicit task ID stays reserved.

mod memory;
mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use mediapub_core::models::{Task, TaskStats, TaskStatus};

use crate::error::BrokerResult;

/// Extra time an active task may run past its timeout before it is
/// considered orphaned and handed back to the queue.
pub const DEFAULT_LEASE_GRACE: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a new task. Fails with `TaskIdConflict` while a task with the
    /// same ID is retained.
    async fn enqueue(&self, task: Task) -> BrokerResult<()>;

    /// Claim the next ready task and mark it active.
    async fn dequeue(&self) -> BrokerResult<Option<Task>>;

    /// Acknowledge a successful attempt.
    async fn complete(&self, task: &Task) -> BrokerResult<()>;

    /// Record a failed attempt and schedule the next one at `process_at`.
    async fn retry(&self, task: &Task, error: &str, process_at: DateTime<Utc>) -> BrokerResult<()>;

    /// Permanently fail the task.
    async fn fail(&self, task: &Task, error: &str) -> BrokerResult<()>;

    async fn get(&self, id: &str) -> BrokerResult<Option<Task>>;

    async fn stats(&self) -> BrokerResult<TaskStats>;

    /// Settle active tasks whose lease expired before `now`. The lost attempt
    /// counts as failed: the task goes back to the queue while it has retry
    /// budget left and is archived as failed otherwise. Returns how many
    /// tasks were settled.
    async fn recover_stale(&self, now: DateTime<Utc>) -> BrokerResult<usize>;

    async fn close(&self) -> BrokerResult<()> {
        Ok(())
    }
}

fn lease_deadline(task: &Task, now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(task.timeout() + grace)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `last_error` of a task whose worker vanished mid-attempt.
pub const LEASE_EXPIRED: &str = "task lease expired before the attempt finished";

/// The stored form of a task after its lease expired: pending with one more
/// failed attempt, or failed when no retries are left.
fn settle_expired(task: &Task, now: DateTime<Utc>) -> Task {
    let mut settled = task.clone();
    settled.last_error = Some(LEASE_EXPIRED.to_string());
    if task.can_retry() {
        settled.retried += 1;
        settled.status = TaskStatus::Pending;
        settled.process_at = now;
    } else {
        settled.status = TaskStatus::Failed;
        settled.completed_at = Some(now);
    }
    settled
}
