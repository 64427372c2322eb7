//! In-process broker. Used by tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use mediapub_core::models::{Task, TaskStats, TaskStatus};

use super::{lease_deadline, settle_expired, Broker, DEFAULT_LEASE_GRACE, LEASE_EXPIRED};
use crate::error::{BrokerError, BrokerResult};

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    pending: VecDeque<String>,
    /// Active task ID -> lease deadline.
    active: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn prune_expired(&mut self, now: DateTime<Utc>) {
        self.tasks.retain(|_, t| !t.is_expired(now));
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Scheduled && t.process_at <= now)
            .map(|t| (t.process_at, t.id.clone()))
            .collect();
        due.sort();
        for (_, id) in due {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::Pending;
            }
            self.pending.push_back(id);
        }
    }

    fn archive(&mut self, task: &Task, status: TaskStatus, error: Option<&str>) {
        self.active.remove(&task.id);
        if task.retention_seconds == 0 {
            self.tasks.remove(&task.id);
            return;
        }
        let mut stored = task.clone();
        stored.status = status;
        stored.completed_at = Some(Utc::now());
        if let Some(error) = error {
            stored.last_error = Some(error.to_string());
        }
        self.tasks.insert(stored.id.clone(), stored);
    }
}

/// Broker keeping all state in memory behind an async mutex.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    lease_grace: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lease_grace: DEFAULT_LEASE_GRACE,
        }
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    /// All retained tasks, oldest first.
    pub async fn snapshot(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        tasks
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task: Task) -> BrokerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.prune_expired(Utc::now());
        if inner.tasks.contains_key(&task.id) {
            return Err(BrokerError::TaskIdConflict(task.id));
        }
        if task.status == TaskStatus::Pending {
            inner.pending.push_back(task.id.clone());
        }
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn dequeue(&self) -> BrokerResult<Option<Task>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.promote_due(now);

        while let Some(id) = inner.pending.pop_front() {
            let Some(task) = inner.tasks.get_mut(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            task.status = TaskStatus::Active;
            let task = task.clone();
            let deadline = lease_deadline(&task, now, self.lease_grace);
            inner.active.insert(id, deadline);
            return Ok(Some(task));
        }
        Ok(None)
    }

    async fn complete(&self, task: &Task) -> BrokerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.archive(task, TaskStatus::Completed, None);
        Ok(())
    }

    async fn retry(&self, task: &Task, error: &str, process_at: DateTime<Utc>) -> BrokerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.active.remove(&task.id);
        let mut stored = task.clone();
        stored.retried += 1;
        stored.last_error = Some(error.to_string());
        stored.status = TaskStatus::Scheduled;
        stored.process_at = process_at;
        inner.tasks.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn fail(&self, task: &Task, error: &str) -> BrokerResult<()> {
        let mut inner = self.inner.lock().await;
        inner.archive(task, TaskStatus::Failed, Some(error));
        Ok(())
    }

    async fn get(&self, id: &str) -> BrokerResult<Option<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .get(id)
            .filter(|t| !t.is_expired(Utc::now()))
            .cloned())
    }

    async fn stats(&self) -> BrokerResult<TaskStats> {
        let mut inner = self.inner.lock().await;
        inner.prune_expired(Utc::now());
        let mut stats = TaskStats::default();
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Scheduled => stats.scheduled += 1,
                TaskStatus::Active => stats.active += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn recover_stale(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let stale: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.active.remove(id);
            let Some(task) = inner.tasks.get(id) else {
                continue;
            };
            let settled = settle_expired(task, now);
            if settled.status == TaskStatus::Pending {
                inner.pending.push_back(id.clone());
                inner.tasks.insert(id.clone(), settled);
            } else {
                tracing::warn!(task_id = %id, "Task lease expired with no retries left");
                inner.archive(&settled, TaskStatus::Failed, Some(LEASE_EXPIRED));
            }
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediapub_core::models::{TaskOptions, TaskType};
    use serde_json::json;

    fn task(opts: TaskOptions) -> Task {
        Task::new(TaskType::from_static("test:noop"), json!({}), &opts)
    }

    #[tokio::test]
    async fn fifo_dequeue_and_complete() {
        let broker = MemoryBroker::new();
        let first = task(TaskOptions::default());
        let second = task(TaskOptions::default());
        broker.enqueue(first.clone()).await.unwrap();
        broker.enqueue(second.clone()).await.unwrap();

        let claimed = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, TaskStatus::Active);

        broker.complete(&claimed).await.unwrap();
        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn duplicate_task_id_rejected_while_retained() {
        let broker = MemoryBroker::new();
        let opts = TaskOptions::default().task_id("upload-1");
        broker.enqueue(task(opts.clone())).await.unwrap();
        let err = broker.enqueue(task(opts)).await.unwrap_err();
        assert!(matches!(err, BrokerError::TaskIdConflict(id) if id == "upload-1"));
    }

    #[tokio::test]
    async fn task_id_released_after_retention() {
        let broker = MemoryBroker::new();
        let opts = TaskOptions::default()
            .task_id("upload-2")
            .retention(Duration::ZERO);
        broker.enqueue(task(opts.clone())).await.unwrap();
        let claimed = broker.dequeue().await.unwrap().unwrap();
        broker.complete(&claimed).await.unwrap();
        broker.enqueue(task(opts)).await.unwrap();
    }

    #[tokio::test]
    async fn retry_schedules_in_future() {
        let broker = MemoryBroker::new();
        broker.enqueue(task(TaskOptions::default())).await.unwrap();
        let claimed = broker.dequeue().await.unwrap().unwrap();
        broker
            .retry(&claimed, "boom", Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert!(broker.dequeue().await.unwrap().is_none());
        let stored = broker.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.retried, 1);
        assert_eq!(stored.status, TaskStatus::Scheduled);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_active_tasks_are_requeued() {
        let broker = MemoryBroker::new().with_lease_grace(Duration::ZERO);
        broker
            .enqueue(task(TaskOptions::default().timeout(Duration::from_secs(1))))
            .await
            .unwrap();
        let claimed = broker.dequeue().await.unwrap().unwrap();

        assert_eq!(broker.recover_stale(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(broker.recover_stale(later).await.unwrap(), 1);

        let again = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.retried, 1);
        assert_eq!(again.last_error.as_deref(), Some(LEASE_EXPIRED));
    }

    #[tokio::test]
    async fn stale_task_without_budget_is_failed() {
        let broker = MemoryBroker::new().with_lease_grace(Duration::ZERO);
        broker
            .enqueue(task(
                TaskOptions::default()
                    .max_retry(1)
                    .timeout(Duration::from_secs(1)),
            ))
            .await
            .unwrap();

        let later = || Utc::now() + chrono::Duration::seconds(5);
        let first = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(broker.recover_stale(later()).await.unwrap(), 1);
        let second = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);

        // The second lost attempt exhausts the budget.
        assert_eq!(broker.recover_stale(later()).await.unwrap(), 1);
        assert!(broker.dequeue().await.unwrap().is_none());
        let stored = broker.get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(LEASE_EXPIRED));
        assert_eq!(broker.stats().await.unwrap().failed, 1);
    }
}
