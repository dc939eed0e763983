//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{ErrorResponse, SessionCreatedResponse, SuccessResponse, TurnRequest};
use super::AppState;
use crate::conversation::ConversationState;
use crate::runtime::TurnError;
use crate::schema::ResponseEnvelope;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);
    Router::new()
        .route("/api/sessions", post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/:id/turns", post(submit_turn))
        .route("/api/sessions/:id/reset", post(reset_session))
        .route("/api/sessions/:id/stream", get(stream_session))
        .route("/version", get(get_version))
        .layer(body_limit)
        .with_state(state)
}

// ============================================================
// Sessions
// ============================================================

async fn create_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SessionCreatedResponse>), AppError> {
    let session_id = state.assistant.create_session().await?;
    Ok((
        StatusCode::CREATED,
        Json(SessionCreatedResponse { session_id }),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationState>, AppError> {
    state
        .assistant
        .session(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Session not found: {id}")))
}

async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    if state.assistant.reset_session(&id).await? {
        Ok(Json(SuccessResponse { success: true }))
    } else {
        Err(AppError::NotFound(format!("Session not found: {id}")))
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    if state.assistant.delete_session(&id).await? {
        Ok(Json(SuccessResponse { success: true }))
    } else {
        Err(AppError::NotFound(format!("Session not found: {id}")))
    }
}

// ============================================================
// Turns
// ============================================================

/// Runs a turn to completion. A client disconnect drops this future, which
/// cancels the turn's handlers.
async fn submit_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TurnRequest>,
) -> Result<Json<ResponseEnvelope>, AppError> {
    let request = req
        .into_request()
        .map_err(|e| AppError::BadRequest(format!("Invalid image data: {e}")))?;

    let envelope = state
        .assistant
        .process_turn(&id, request, CancellationToken::new())
        .await?;
    Ok(Json(envelope))
}

async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // Subscribe first so no phase between snapshot and stream is missed
    let broadcast_rx = state.assistant.subscribe();
    let snapshot = state
        .assistant
        .session(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Session not found: {id}")))?;

    Ok(sse_stream(id, snapshot, broadcast_rx))
}

async fn get_version() -> &'static str {
    concat!("property-assist ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<TurnError> for AppError {
    fn from(e: TurnError) -> Self {
        match e {
            TurnError::InvalidRequest(_) => AppError::BadRequest(e.to_string()),
            TurnError::Cancelled | TurnError::Storage(_) | TurnError::Internal(_) => {
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
