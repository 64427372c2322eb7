//! Result channel: deliver a handler's outcome to the service that asked for
//! the work, as a task of a second type consumed by that service's handler.
//!
//! Delivery is itself a task, so it is retried like any other. No ordering is
//! implied between results of the same correlation ID; consumers order by the
//! payload's fields.

use std::marker::PhantomData;
use std::time::Duration;

use mediapub_core::models::{TaskOptions, TaskPayload};

use crate::bus::TaskProducer;
use crate::error::BrokerResult;

pub struct ResultChannel<R> {
    producer: TaskProducer,
    options: TaskOptions,
    _result: PhantomData<fn(R)>,
}

impl<R> Clone for ResultChannel<R> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
            options: self.options.clone(),
            _result: PhantomData,
        }
    }
}

impl<R: TaskPayload> ResultChannel<R> {
    pub fn new(producer: TaskProducer) -> Self {
        Self {
            producer,
            options: TaskOptions::default()
                .max_retry(10)
                .timeout(Duration::from_secs(60)),
            _result: PhantomData,
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// Emit `result` for the request identified by `correlation_id`.
    pub async fn send(&self, correlation_id: &str, result: &R) -> BrokerResult<String> {
        let mut opts = self.options.clone();
        opts.task_id = None;
        let id = self.producer.put_payload(result, opts).await?;
        tracing::debug!(
            correlation_id = %correlation_id,
            result_task_id = %id,
            result_type = %R::task_type(),
            "Result delivered to result channel"
        );
        Ok(id)
    }
}
