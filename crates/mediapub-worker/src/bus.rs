//! Task bus: producer API, worker pool, retry and shutdown.
//!
//! Shutdown: [`TaskBus::shutdown`] stops dequeuing, then
//! [`TaskBus::start_handlers`] waits up to the configured grace period for
//! in-flight handlers before aborting them and closing the broker. Aborted
//! tasks stay active in the broker until their lease expires, after which the
//! stale-task reaper hands them back to the queue.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use mediapub_core::models::{Task, TaskOptions, TaskPayload, TaskStats, TaskType};
use mediapub_core::{Config, TaskError};

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::registry::{default_retry_delay, HandlerContext, HandlerRegistry, RetryDelayFn};

#[derive(Debug, Clone)]
pub struct TaskBusConfig {
    pub queue: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Interval in seconds between queue depth reports. 0 = disabled.
    pub stats_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Interval in seconds between runs of the stale task reaper. 0 = disabled.
    pub stale_task_reap_interval_secs: u64,
}

impl Default for TaskBusConfig {
    fn default() -> Self {
        Self {
            queue: "mediapub".to_string(),
            concurrency: 4,
            poll_interval_ms: 1000,
            stats_interval_secs: 60,
            shutdown_grace_secs: 30,
            stale_task_reap_interval_secs: 60,
        }
    }
}

impl From<&Config> for TaskBusConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue: config.task_bus_queue.clone(),
            concurrency: config.task_bus_concurrency.max(1),
            poll_interval_ms: config.task_bus_poll_interval_ms,
            stats_interval_secs: config.task_bus_stats_interval_secs,
            shutdown_grace_secs: config.task_bus_shutdown_grace_secs,
            ..Self::default()
        }
    }
}

/// Cloneable enqueue handle. Holds no worker state.
#[derive(Clone)]
pub struct TaskProducer {
    broker: Arc<dyn Broker>,
}

impl TaskProducer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Serialize `payload` and enqueue it under `task_type`. Returns the task ID.
    #[tracing::instrument(skip(self, payload, opts), fields(task_type = %task_type))]
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        task_type: TaskType,
        payload: &T,
        opts: TaskOptions,
    ) -> BrokerResult<String> {
        let payload = serde_json::to_value(payload)?;
        let task = Task::new(task_type, payload, &opts);
        let id = task.id.clone();
        let task_type = task.task_type.clone();

        self.broker.enqueue(task).await.map_err(|e| {
            tracing::error!(
                error = %e,
                task_id = %id,
                task_type = %task_type,
                "Failed to enqueue task"
            );
            e
        })?;

        tracing::info!(
            task_id = %id,
            task_type = %task_type,
            max_retry = opts.max_retry,
            timeout_secs = opts.timeout.as_secs(),
            "Task submitted to queue"
        );
        Ok(id)
    }

    pub async fn put_payload<P: TaskPayload>(
        &self,
        payload: &P,
        opts: TaskOptions,
    ) -> BrokerResult<String> {
        self.put(P::task_type(), payload, opts).await
    }

    pub async fn stats(&self) -> BrokerResult<TaskStats> {
        self.broker.stats().await
    }

    pub async fn get(&self, id: &str) -> BrokerResult<Option<Task>> {
        self.broker.get(id).await
    }
}

pub struct TaskBus {
    producer: TaskProducer,
    broker: Arc<dyn Broker>,
    config: TaskBusConfig,
    registry: Mutex<HandlerRegistry>,
    started: AtomicBool,
    default_retry_delay: RetryDelayFn,
    shutdown: CancellationToken,
}

impl TaskBus {
    pub fn new(broker: Arc<dyn Broker>, config: TaskBusConfig) -> Self {
        Self {
            producer: TaskProducer::new(broker.clone()),
            broker,
            config,
            registry: Mutex::new(HandlerRegistry::new()),
            started: AtomicBool::new(false),
            default_retry_delay: default_retry_delay(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the delay used for handlers without their own policy.
    pub fn with_default_retry_delay(mut self, retry_delay: RetryDelayFn) -> Self {
        self.default_retry_delay = retry_delay;
        self
    }

    pub fn producer(&self) -> TaskProducer {
        self.producer.clone()
    }

    pub async fn put<T: Serialize + ?Sized>(
        &self,
        task_type: TaskType,
        payload: &T,
        opts: TaskOptions,
    ) -> BrokerResult<String> {
        self.producer.put(task_type, payload, opts).await
    }

    pub async fn put_payload<P: TaskPayload>(
        &self,
        payload: &P,
        opts: TaskOptions,
    ) -> BrokerResult<String> {
        self.producer.put_payload(payload, opts).await
    }

    pub async fn stats(&self) -> BrokerResult<TaskStats> {
        self.broker.stats().await
    }

    /// Register a handler for `P`. Must be called before `start_handlers`.
    pub fn add_handler<P, F, Fut>(&self, handler: F) -> BrokerResult<()>
    where
        P: TaskPayload,
        F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.with_registry(|registry| registry.register::<P, F, Fut>(handler))
    }

    pub fn add_handler_with_retry_delay<P, F, Fut>(
        &self,
        handler: F,
        retry_delay: RetryDelayFn,
    ) -> BrokerResult<()>
    where
        P: TaskPayload,
        F: Fn(HandlerContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.with_registry(|registry| {
            registry.register_with_retry_delay::<P, F, Fut>(handler, retry_delay)
        })
    }

    fn with_registry<R>(
        &self,
        f: impl FnOnce(&mut HandlerRegistry) -> BrokerResult<R>,
    ) -> BrokerResult<R> {
        if self.started.load(Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted);
        }
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| BrokerError::backend("handler registry lock poisoned"))?;
        f(&mut registry)
    }

    /// Run the worker pool until [`TaskBus::shutdown`] is called.
    pub async fn start_handlers(&self) -> BrokerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyStarted);
        }
        let registry = Arc::new(
            self.registry
                .lock()
                .map_err(|_| BrokerError::backend("handler registry lock poisoned"))?
                .clone(),
        );

        tracing::info!(
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            handlers = ?registry.registered_types(),
            "Task bus worker pool started"
        );

        let background = self.spawn_background_loops();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.try_join_next().is_some() {}

            self.claim_and_dispatch(&semaphore, &registry, &mut in_flight)
                .await;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Task bus worker pool shutting down");
                    break;
                }
                _ = sleep(poll_interval) => {}
            }
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = in_flight.len(),
                grace_secs = grace.as_secs(),
                "Aborting task handlers still running after shutdown grace period"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        for handle in background {
            let _ = handle.await;
        }
        self.broker.close().await?;
        tracing::info!("Task bus worker pool stopped");
        Ok(())
    }

    /// Claim tasks until the broker is empty or every worker is busy.
    async fn claim_and_dispatch(
        &self,
        semaphore: &Arc<Semaphore>,
        registry: &Arc<HandlerRegistry>,
        in_flight: &mut JoinSet<()>,
    ) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::trace!("No workers available, skipping claim");
                    return;
                }
            };

            match self.broker.dequeue().await {
                Ok(Some(task)) => {
                    let broker = self.broker.clone();
                    let registry = registry.clone();
                    let default_delay = self.default_retry_delay.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = process_task(task, broker, registry, default_delay).await {
                            tracing::error!(error = %e, "Failed to record task outcome");
                        }
                    });
                }
                Ok(None) => {
                    tracing::trace!("No tasks available in queue");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim task from queue");
                    return;
                }
            }
        }
    }

    fn spawn_background_loops(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.stats_interval_secs > 0 {
            let broker = self.broker.clone();
            let shutdown = self.shutdown.clone();
            let queue = self.config.queue.clone();
            let every = Duration::from_secs(self.config.stats_interval_secs);
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => match broker.stats().await {
                            Ok(stats) => tracing::info!(
                                queue = %queue,
                                active = stats.active,
                                pending = stats.pending,
                                scheduled = stats.scheduled,
                                completed = stats.completed,
                                failed = stats.failed,
                                "Task queue stats"
                            ),
                            Err(e) => tracing::warn!(error = %e, "Failed to read task queue stats"),
                        },
                        _ = shutdown.cancelled() => break,
                    }
                }
            }));
        }

        if self.config.stale_task_reap_interval_secs > 0 {
            let broker = self.broker.clone();
            let shutdown = self.shutdown.clone();
            let every = Duration::from_secs(self.config.stale_task_reap_interval_secs);
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => match broker.recover_stale(Utc::now()).await {
                            Ok(0) => {}
                            Ok(n) => tracing::warn!(settled = n, "Settled tasks with expired leases"),
                            Err(e) => tracing::error!(error = %e, "Stale task reaper failed"),
                        },
                        _ = shutdown.cancelled() => break,
                    }
                }
            }));
        }

        handles
    }

    /// Stop dequeuing. `start_handlers` returns once in-flight work drained.
    pub fn shutdown(&self) {
        tracing::info!("Initiating task bus shutdown");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[tracing::instrument(
    skip(task, broker, registry, default_delay),
    fields(task_id = %task.id, task_type = %task.task_type, retried = task.retried)
)]
async fn process_task(
    task: Task,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    default_delay: RetryDelayFn,
) -> BrokerResult<()> {
    let Some(entry) = registry.get(&task.task_type) else {
        tracing::error!("No handler registered for task type, failing task");
        return broker
            .fail(&task, &format!("no handler registered for {}", task.task_type))
            .await;
    };

    let outcome = match tokio::time::timeout(task.timeout(), entry.handler.call(&task)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "task timed out after {}s",
            task.timeout_seconds
        )),
    };

    match outcome {
        Ok(()) => {
            broker.complete(&task).await?;
            tracing::info!("Task completed successfully");
        }
        Err(e) if TaskError::is_skip_retry(&e) => {
            tracing::error!(error = %e, "Task failed with skip-retry error, will not retry");
            broker.fail(&task, &e.to_string()).await?;
        }
        Err(e) if task.can_retry() => {
            let attempt = task.retried + 1;
            let delay_fn = entry.retry_delay.as_ref().unwrap_or(&default_delay);
            let delay = delay_fn(attempt, &e, &task);
            let process_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(10));
            tracing::warn!(
                error = %e,
                attempt,
                max_retry = task.max_retry,
                delay_secs = delay.as_secs(),
                "Task failed, scheduling retry"
            );
            broker.retry(&task, &e.to_string(), process_at).await?;
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                max_retry = task.max_retry,
                "Task failed after maximum retries"
            );
            broker.fail(&task, &e.to_string()).await?;
        }
    }
    Ok(())
}
