//! Mediapub task bus.
//!
//! At-least-once execution of typed tasks through a [`Broker`]: producers
//! `put` serialized payloads, a fixed-size worker pool dequeues them and runs
//! the handler registered for the task type, and failures are retried,
//! delayed or archived according to the [`TaskError`](mediapub_core::TaskError)
//! classification.

pub mod broker;
pub mod bus;
pub mod error;
pub mod registry;
pub mod result;

pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use bus::{TaskBus, TaskBusConfig, TaskProducer};
pub use error::{BrokerError, BrokerResult};
pub use registry::{
    default_retry_delay, HandlerContext, HandlerRegistry, RetryDelayFn, DEFAULT_RETRY_DELAY,
};
pub use result::ResultChannel;
