//! Admin-facing HTTP handlers: session provisioning, user status pushes,
//! and the health probe.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use proctor_core::{CommunicationMethod, SessionId, UserId, VoiceRoom};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub station_id: Option<String>,
    #[serde(default)]
    pub communication_method: Option<CommunicationMethod>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub communication_method: CommunicationMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_room: Option<VoiceRoom>,
}

/// POST /sessions — provision a session ahead of the first connection.
/// Voice sessions get their Jitsi room allocated eagerly so the response
/// can carry the join URL.
pub(crate) async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    let Some(station_id) = req
        .station_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "stationId is required" })),
        )
            .into_response();
    };

    let method = req.communication_method.unwrap_or_default();
    let session_id = SessionId::new();
    let voice_room = match method {
        CommunicationMethod::Voice => Some(state.allocator.allocate(&session_id)),
        CommunicationMethod::Meet => None,
    };

    match state
        .store
        .create(session_id.clone(), station_id, method, voice_room.clone())
    {
        Ok(_) => {
            tracing::info!(session_id = %session_id, method = ?method, "session created");
            (
                StatusCode::CREATED,
                Json(CreateSessionResponse {
                    session_id,
                    communication_method: method,
                    voice_room,
                }),
            )
                .into_response()
        }
        // UUIDv7 ids make this unreachable in practice
        Err(err) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: Option<String>,
}

/// POST /users/{id}/status — forward a presence update to the profile
/// store on behalf of a client.
pub(crate) async fn update_user_status(
    Path(user_id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<UpdateStatusRequest>,
) -> Response {
    let Some(status) = req
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "status is required" })),
        )
            .into_response();
    };

    let user_id = UserId::from_raw(user_id);
    match state.profiles.update_status(&user_id, status).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => {
            tracing::error!(user_id = %user_id, error = %err, "status update failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /health — liveness probe.
pub(crate) async fn health() -> Response {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}
