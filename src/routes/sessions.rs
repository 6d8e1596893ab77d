use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info};

use crate::models::{AppState, CreateSessionResponse, MessageRequest, MessageResponse, SessionId, Stage, WorkflowSession};
use crate::types::AppError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/messages", post(post_message))
        .with_state(state)
}

async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<CreateSessionResponse>) {
    let session_id = state.registry.create().await;
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            current_stage: Stage::Formulation,
        }),
    )
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<WorkflowSession>, Response> {
    state.registry.snapshot(id).await.map(Json).map_err(error_response)
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> Result<StatusCode, Response> {
    state.registry.close(id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, Response> {
    info!(session_id = %id, "Message received");

    let reply = state
        .registry
        .send_message(id, request.message)
        .await
        .map_err(error_response)?;

    Ok(Json(MessageResponse {
        session_id: id,
        current_stage: reply.current_stage,
        messages: reply.messages,
    }))
}

fn error_response(err: AppError) -> Response {
    let status = match &err {
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        AppError::SessionClosed(_) => StatusCode::GONE,
        _ => {
            error!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
