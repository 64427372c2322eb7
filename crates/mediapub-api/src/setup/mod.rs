//! Application setup and initialization
//!
//! [`services::create_components`] builds the production backends from
//! [`Config`]; [`assemble`] wires any set of backends into the orchestrator,
//! the task bus handlers and the router.

pub mod database;
pub mod routes;
pub mod server;
pub mod services;

use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

use mediapub_core::Config;
use mediapub_db::UploadStore;
use mediapub_infra::DistributedLock;
use mediapub_processing::Analyzer;
use mediapub_storage::{BlobIndex, BlobStore, UploadStorage, Uploader};
use mediapub_worker::{Broker, ResultChannel, TaskBus, TaskBusConfig};

use crate::auth::UserResolver;
use crate::hooks::{HookDispatcher, DEFAULT_HOOK_BUFFER};
use crate::orchestrator::UploadOrchestrator;
use crate::rpc::RpcClient;
use crate::state::AppState;
use crate::task_handlers::{
    register_handlers, BusResultSink, DirectResultSink, ResultRecorder, ResultSink,
    UploadProcessor,
};

/// The backends the application runs on.
pub struct Components {
    pub store: Arc<dyn UploadStore>,
    pub upload_storage: Arc<dyn UploadStorage>,
    pub lock: Arc<dyn DistributedLock>,
    pub broker: Arc<dyn Broker>,
    pub blob_destinations: Vec<Arc<dyn BlobStore>>,
    pub blob_index: Arc<dyn BlobIndex>,
    pub rpc: Arc<dyn RpcClient>,
    pub users: Arc<dyn UserResolver>,
    /// Persist processing results in-process instead of through the bus.
    pub direct_results: bool,
}

pub struct Application {
    pub state: Arc<AppState>,
    pub bus: Arc<TaskBus>,
    pub router: Router,
}

/// Wire `components` together. Spawns the hook listeners, so it must run
/// inside a tokio runtime; the task bus is returned unstarted.
pub fn assemble(config: &Config, components: Components) -> Result<Application> {
    let bus = Arc::new(TaskBus::new(
        components.broker.clone(),
        TaskBusConfig::from(config),
    ));

    let recorder = Arc::new(ResultRecorder::new(
        components.store.clone(),
        components.upload_storage.clone(),
    ));
    let sink: Arc<dyn ResultSink> = if components.direct_results {
        Arc::new(DirectResultSink::new(recorder.clone()))
    } else {
        Arc::new(BusResultSink::new(ResultChannel::new(bus.producer())))
    };

    let processor = Arc::new(UploadProcessor::new(
        components.upload_storage.clone(),
        Analyzer::new(config.ffprobe_path.clone()),
        Uploader::new(components.blob_destinations, components.blob_index),
        components.rpc,
        sink,
        config.blobs_dir.clone(),
    ));
    register_handlers(&bus, processor, recorder).context("Failed to register task handlers")?;

    let orchestrator = Arc::new(UploadOrchestrator::new(
        components.store,
        components.upload_storage,
        components.lock,
        bus.producer(),
        components.users.clone(),
        Duration::from_secs(config.lock_lease_seconds),
    ));
    let hooks = Arc::new(HookDispatcher::start(
        orchestrator.clone(),
        DEFAULT_HOOK_BUFFER,
    ));

    let state = Arc::new(AppState {
        orchestrator,
        hooks,
        users: components.users,
    });
    let router = routes::setup_routes(state.clone());

    Ok(Application { state, bus, router })
}
