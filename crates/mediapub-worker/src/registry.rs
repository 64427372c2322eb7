//! Typed handler registry.
//!
//! Handlers are registered against a [`TaskPayload`] type. The registry keys
//! them by the payload's task type and decodes the JSON payload before the
//! handler runs; a payload that does not decode fails the task permanently.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use mediapub_core::models::{Task, TaskPayload, TaskType};
use mediapub_core::TaskError;

use crate::error::{BrokerError, BrokerResult};

/// Computes the delay before the next attempt: `(attempt, error, task)`,
/// where `attempt` is the 1-based number of the attempt that just failed.
pub type RetryDelayFn = Arc<dyn Fn(u32, &anyhow::Error, &Task) -> Duration + Send + Sync>;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

pub fn default_retry_delay() -> RetryDelayFn {
    Arc::new(|_, _, _| DEFAULT_RETRY_DELAY)
}

/// What a handler knows about the delivery it is processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    pub task_id: String,
    pub task_type: TaskType,
    /// Attempts that already failed.
    pub retried: u32,
    pub max_retry: u32,
}

impl HandlerContext {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            retried: task.retried,
            max_retry: task.max_retry,
        }
    }

    /// A retryable failure of this attempt archives the task.
    pub fn is_last_attempt(&self) -> bool {
        self.retried >= self.max_retry
    }
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn call(&self, task: &Task) -> anyhow::Result<()>;
}

struct TypedHandler<P, F> {
    handler: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> ErasedHandler for TypedHandler<P, F>
where
    P: TaskPayload,
    F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, task: &Task) -> anyhow::Result<()> {
        let payload = task.try_payload_as::<P>().map_err(|e| {
            TaskError::skip_retry(
                anyhow::Error::new(e).context(format!("malformed {} payload", task.task_type)),
            )
        })?;
        (self.handler)(HandlerContext::from_task(task), payload).await
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredHandler {
    pub(crate) handler: Arc<dyn ErasedHandler>,
    pub(crate) retry_delay: Option<RetryDelayFn>,
}

/// Task type -> handler map, validated at registration time.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P, F, Fut>(&mut self, handler: F) -> BrokerResult<()>
    where
        P: TaskPayload,
        F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert::<P, F, Fut>(handler, None)
    }

    /// Register a handler with its own retry delay policy.
    pub fn register_with_retry_delay<P, F, Fut>(
        &mut self,
        handler: F,
        retry_delay: RetryDelayFn,
    ) -> BrokerResult<()>
    where
        P: TaskPayload,
        F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert::<P, F, Fut>(handler, Some(retry_delay))
    }

    fn insert<P, F, Fut>(&mut self, handler: F, retry_delay: Option<RetryDelayFn>) -> BrokerResult<()>
    where
        P: TaskPayload,
        F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task_type = P::task_type();
        if self.handlers.contains_key(&task_type) {
            return Err(BrokerError::DuplicateHandler(task_type));
        }
        let erased: Arc<dyn ErasedHandler> = Arc::new(TypedHandler::<P, F> {
            handler,
            _payload: PhantomData,
        });
        self.handlers.insert(
            task_type,
            RegisteredHandler {
                handler: erased,
                retry_delay,
            },
        );
        Ok(())
    }

    pub(crate) fn get(&self, task_type: &TaskType) -> Option<&RegisteredHandler> {
        self.handlers.get(task_type)
    }

    pub fn is_registered(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.handlers.keys().cloned().collect()
    }
}
