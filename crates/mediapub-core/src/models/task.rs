use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Name of a task kind. Handlers are registered against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(Cow<'static, str>);

impl TaskType {
    pub const UPLOAD_PROCESS: TaskType = TaskType::from_static("upload:process");
    pub const UPLOAD_PROCESS_RESULT: TaskType = TaskType::from_static("upload:process:result");

    pub const fn from_static(name: &'static str) -> Self {
        TaskType(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Invalid task type: empty name"));
        }
        Ok(TaskType(Cow::Owned(s.to_string())))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Active,
    Completed,
    Failed,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Scheduled => write!(f, "scheduled"),
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "active" => Ok(TaskStatus::Active),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// Per-task delivery options supplied to `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub max_retry: u32,
    pub timeout: Duration,
    /// How long the task stays visible after it completed or failed.
    pub retention: Duration,
    /// Explicit task ID. A second `put` with the same ID is rejected while
    /// the first one is retained.
    pub task_id: Option<String>,
    /// Delay before the first attempt.
    pub process_in: Option<Duration>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retry: 3,
            timeout: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(72 * 60 * 60),
            task_id: None,
            process_in: None,
        }
    }
}

impl TaskOptions {
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self
    }
}

/// A unit of work as stored by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    /// Serialized ahead of `payload`: the Redis broker rewrites the first
    /// `"status"` member of the stored JSON in place.
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub max_retry: u32,
    /// Number of attempts that already failed.
    pub retried: u32,
    pub timeout_seconds: u64,
    pub retention_seconds: u64,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub process_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_type: TaskType, payload: serde_json::Value, opts: &TaskOptions) -> Self {
        let now = Utc::now();
        let process_at = opts
            .process_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d)
            .unwrap_or(now);
        let status = if process_at > now {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };

        Task {
            id: opts
                .task_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_type,
            payload,
            status,
            max_retry: opts.max_retry,
            retried: 0,
            timeout_seconds: opts.timeout.as_secs(),
            retention_seconds: opts.retention.as_secs(),
            last_error: None,
            enqueued_at: now,
            process_at,
            completed_at: None,
        }
    }

    pub fn is_ready_to_run(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Scheduled)
            && self.process_at <= Utc::now()
    }

    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }

    /// True when a failure of the current attempt exhausts the retry budget.
    pub fn is_last_attempt(&self) -> bool {
        !self.can_retry()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    /// Whether a finished task has outlived its retention window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.completed_at {
            Some(done) => {
                now.signed_duration_since(done).num_seconds() >= self.retention_seconds as i64
            }
            None => false,
        }
    }

    /// Extract the payload as a typed struct.
    /// Returns None if deserialization fails.
    pub fn payload_as<P: TaskPayload>(&self) -> Option<P> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Extract the payload as a typed struct, returning an error on failure.
    pub fn try_payload_as<P: TaskPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Trait for type-safe task payloads
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn task_type() -> TaskType;
}

/// Queue depth by state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStats {
    pub pending: u64,
    pub scheduled: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskStats {
    pub fn total(&self) -> u64 {
        self.pending + self.scheduled + self.active + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    impl TaskPayload for Ping {
        fn task_type() -> TaskType {
            TaskType::from_static("test:ping")
        }
    }

    #[test]
    fn test_task_type_round_trips_as_plain_string() {
        let json = serde_json::to_string(&TaskType::UPLOAD_PROCESS).unwrap();
        assert_eq!(json, "\"upload:process\"");
        let parsed: TaskType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskType::UPLOAD_PROCESS);
        assert_eq!(
            "upload:process:result".parse::<TaskType>().unwrap(),
            TaskType::UPLOAD_PROCESS_RESULT
        );
        assert!("  ".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_task_status_from_str() {
        assert_eq!("active".parse::<TaskStatus>().unwrap(), TaskStatus::Active);
        assert_eq!(TaskStatus::Scheduled.to_string(), "scheduled");
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_default_options() {
        let opts = TaskOptions::default();
        assert_eq!(opts.max_retry, 3);
        assert_eq!(opts.timeout, Duration::from_secs(3600));
        assert_eq!(opts.retention, Duration::from_secs(72 * 3600));
        assert!(opts.task_id.is_none());
    }

    #[test]
    fn test_new_task_uses_supplied_id_and_schedule() {
        let opts = TaskOptions::default()
            .task_id("upload-1")
            .process_in(Duration::from_secs(30));
        let task = Task::new(Ping::task_type(), serde_json::json!({"n": 1}), &opts);
        assert_eq!(task.id, "upload-1");
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert!(!task.is_ready_to_run());

        let task = Task::new(Ping::task_type(), serde_json::json!({"n": 1}), &TaskOptions::default());
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.is_ready_to_run());
        assert!(Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn test_retry_budget() {
        let mut task = Task::new(
            Ping::task_type(),
            serde_json::json!({"n": 1}),
            &TaskOptions::default().max_retry(2),
        );
        assert!(task.can_retry());
        task.retried = 2;
        assert!(!task.can_retry());
        assert!(task.is_last_attempt());
    }

    #[test]
    fn test_payload_decoding() {
        let task = Task::new(Ping::task_type(), serde_json::json!({"n": 7}), &TaskOptions::default());
        assert_eq!(task.payload_as::<Ping>(), Some(Ping { n: 7 }));

        let bad = Task::new(Ping::task_type(), serde_json::json!({"n": "x"}), &TaskOptions::default());
        assert!(bad.try_payload_as::<Ping>().is_err());
    }

    #[test]
    fn test_expiry_after_retention() {
        let mut task = Task::new(
            Ping::task_type(),
            serde_json::json!({"n": 1}),
            &TaskOptions::default().retention(Duration::from_secs(10)),
        );
        let now = Utc::now();
        assert!(!task.is_expired(now));
        task.completed_at = Some(now - chrono::Duration::seconds(11));
        assert!(task.is_expired(now));
    }
}
