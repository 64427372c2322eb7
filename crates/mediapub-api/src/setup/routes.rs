//! Route configuration

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::constants::{API_PREFIX, MAX_BODY_BYTES};
use crate::handlers::{health, uploads};
use crate::state::AppState;

pub fn setup_routes(state: Arc<AppState>) -> Router {
    // The hook endpoint is called by the upload protocol handler, not by
    // clients; the user comes from the forwarded headers in the payload.
    let public_routes = Router::new().route("/uploads/hooks", post(uploads::receive_hook));

    let protected_routes = Router::new()
        .route("/uploads/{id}/notify", post(uploads::notify))
        .route("/uploads/{id}/status", get(uploads::status))
        .layer(axum::middleware::from_fn_with_state(
            state.users.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health::health))
        .nest(API_PREFIX, public_routes.merge(protected_routes))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
