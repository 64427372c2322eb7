use mediapub_core::models::TaskType;

/// Errors raised by the task bus and its brokers.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("task id conflicts with a retained task: {0}")]
    TaskIdConflict(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("handler already registered for task type {0}")]
    DuplicateHandler(TaskType),

    #[error("task bus already started")]
    AlreadyStarted,

    #[error("failed to serialize task: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BrokerError {
    pub fn backend(message: impl Into<String>) -> Self {
        BrokerError::Backend {
            message: message.into(),
            source: None,
        }
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Backend {
            message: format!("Redis error: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

impl From<BrokerError> for mediapub_core::AppError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::TaskIdConflict(id) => {
                mediapub_core::AppError::Conflict(format!("processing already scheduled for {id}"))
            }
            other => mediapub_core::AppError::Broker(other.to_string()),
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
