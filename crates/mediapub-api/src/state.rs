//! Application state shared by the HTTP handlers.

use std::sync::Arc;

use crate::auth::UserResolver;
use crate::hooks::HookDispatcher;
use crate::orchestrator::UploadOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<UploadOrchestrator>,
    pub hooks: Arc<HookDispatcher>,
    pub users: Arc<dyn UserResolver>,
}
