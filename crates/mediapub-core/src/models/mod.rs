//! Data models for the application
//!
//! Task bus messages, upload and publish records, resumable-upload hook
//! events and the JSON-RPC envelope.

mod hook;
mod rpc;
mod task;
mod upload;

// Re-export all models for convenient imports
pub use hook::*;
pub use rpc::*;
pub use task::*;
pub use upload::*;
