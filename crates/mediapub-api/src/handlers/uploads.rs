use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use mediapub_core::models::{HookRequest, PublishStatus, RpcRequest};

use crate::auth::AuthUser;
use crate::constants::status_url;
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub upload_id: String,
    pub status_url: String,
}

#[derive(Debug, Serialize)]
struct PublishFailure {
    upload_id: String,
    error: String,
}

/// Receive a resumable-upload lifecycle hook.
///
/// Always answers `200 {}` once the event is queued; unknown hook types are
/// acknowledged and ignored.
#[tracing::instrument(skip(state, request), fields(hook = %request.hook_type, upload_id = %request.event.upload.id))]
pub async fn receive_hook(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<HookRequest>,
) -> Json<serde_json::Value> {
    match request.into_event() {
        Some(event) => {
            if let Err(e) = state.hooks.dispatch(event).await {
                tracing::error!(error = %e, "Failed to queue hook event");
            }
        }
        None => tracing::debug!("Ignoring hook type without lifecycle meaning"),
    }
    Json(json!({}))
}

#[tracing::instrument(skip(state, request), fields(user_id = user.user_id))]
pub async fn notify(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
    ValidatedJson(request): ValidatedJson<RpcRequest>,
) -> Result<(StatusCode, Json<NotifyResponse>), HttpAppError> {
    state
        .orchestrator
        .notify(&upload_id, user.user_id, request)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(NotifyResponse {
            status_url: status_url(&upload_id),
            upload_id,
        }),
    ))
}

/// Poll the publish outcome: 202 while processing, 200 with the RPC
/// response on success, 409 on failure.
#[tracing::instrument(skip(state), fields(user_id = user.user_id))]
pub async fn status(
    user: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<Response, HttpAppError> {
    let status = state
        .orchestrator
        .get_status(&upload_id, user.user_id)
        .await?;

    let response = match status {
        PublishStatus::Accepted => (
            StatusCode::ACCEPTED,
            Json(json!({ "upload_id": upload_id, "status": "accepted" })),
        )
            .into_response(),
        PublishStatus::Succeeded(response) => (StatusCode::OK, Json(response)).into_response(),
        PublishStatus::Failed {
            response: Some(response),
            ..
        } => (StatusCode::CONFLICT, Json(response)).into_response(),
        PublishStatus::Failed {
            error,
            response: None,
        } => (StatusCode::CONFLICT, Json(PublishFailure { upload_id, error })).into_response(),
    };
    Ok(response)
}
