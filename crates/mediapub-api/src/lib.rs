//! Mediapub API Library
//!
//! HTTP surface, upload orchestration and the task bus handlers that turn a
//! finished upload into published blobs and a downstream RPC call.

pub mod auth;
pub mod constants;
pub mod error;
mod handlers;
pub mod hooks;
pub mod orchestrator;
pub mod rpc;
pub mod setup;
pub mod state;
pub mod task_handlers;

pub use error::HttpAppError;
pub use orchestrator::UploadOrchestrator;
pub use setup::{assemble, Application, Components};
