use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};

use crate::{
    AppState, dual_debug, dual_error, dual_info, dual_warn,
    error::{ServerError, ServerResult},
    memory::{
        CloseOutcome, MemoryMode, MemoryStats, MessageRole, Session, SessionError, SessionManager,
        SessionMessage, SessionSummary,
    },
};

#[derive(Debug, Deserialize)]
pub(crate) struct TurnRequest {
    #[serde(default = "default_turn_role")]
    pub role: String,
    pub content: String,
}

fn default_turn_role() -> String {
    MessageRole::User.to_string()
}

#[derive(Debug, Serialize)]
pub(crate) struct TurnResponse {
    pub session_id: String,
    pub messages: Vec<SessionMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MemoryModeRequest {
    pub mode: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct MemoryModeResponse {
    pub mode: MemoryMode,
}

/// Result of the implicit close performed before a new session is created.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum PreviousSession {
    Closed(CloseOutcome),
    SummaryFailed { session_id: String, error: String },
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateSessionResponse {
    pub session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<PreviousSession>,
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

pub(crate) async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ServerResult<Json<CreateSessionResponse>> {
    let request_id = request_id(&headers);
    let manager = &state.manager;

    // only one session may be open, so the current one is closed first
    let previous = match manager.active_session().await {
        Some(active) => close_previous(manager, active.id(), &request_id).await,
        None => None,
    };

    let session = manager.create_session().await.map_err(|e| {
        dual_error!("Failed to create session: {} - request_id: {}", e, request_id);
        ServerError::from(e)
    })?;

    Ok(Json(CreateSessionResponse { session, previous }))
}

async fn close_previous(
    manager: &SessionManager,
    session_id: &str,
    request_id: &str,
) -> Option<PreviousSession> {
    dual_info!(
        "Closing session {} before creating a new one - request_id: {}",
        session_id,
        request_id
    );

    match manager.close_session(session_id).await {
        Ok(outcome) => Some(PreviousSession::Closed(outcome)),
        Err(e @ SessionError::SummaryFailure(_)) => {
            dual_warn!(
                "Session {} closed but summary generation failed: {} - request_id: {}",
                session_id,
                e,
                request_id
            );
            Some(PreviousSession::SummaryFailed {
                session_id: session_id.to_string(),
                error: e.to_string(),
            })
        }
        // another request closed it first
        Err(e) => {
            dual_debug!(
                "Session {} was no longer open: {} - request_id: {}",
                session_id,
                e,
                request_id
            );
            None
        }
    }
}

pub(crate) async fn list_sessions_handler(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<SessionSummary>> {
    Json(state.manager.list_summaries().await)
}

pub(crate) async fn current_session_handler(
    State(state): State<Arc<AppState>>,
) -> ServerResult<Json<Session>> {
    state
        .manager
        .active_session()
        .await
        .map(Json)
        .ok_or_else(|| ServerError::NotFound("No active session".to_string()))
}

pub(crate) async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ServerResult<Json<Session>> {
    state
        .manager
        .get_session(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("Session not found: {session_id}")))
}

pub(crate) async fn submit_turn_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<TurnRequest>,
) -> ServerResult<Json<TurnResponse>> {
    let request_id = request_id(&headers);

    let role: MessageRole = request
        .role
        .parse()
        .map_err(|e: anyhow::Error| ServerError::BadRequest(e.to_string()))?;
    if request.content.trim().is_empty() {
        return Err(ServerError::BadRequest(
            "Message content must not be empty".to_string(),
        ));
    }

    dual_info!(
        "Received a {} turn for session {} - request_id: {}",
        role,
        session_id,
        request_id
    );

    let messages = state
        .manager
        .submit_turn(&session_id, role, request.content)
        .await
        .map_err(|e| {
            dual_error!("Failed to submit turn: {} - request_id: {}", e, request_id);
            ServerError::from(e)
        })?;

    Ok(Json(TurnResponse {
        session_id,
        messages,
    }))
}

pub(crate) async fn close_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ServerResult<Json<CloseOutcome>> {
    let request_id = request_id(&headers);

    let outcome = state
        .manager
        .close_session(&session_id)
        .await
        .map_err(|e| {
            dual_error!("Failed to close session: {} - request_id: {}", e, request_id);
            ServerError::from(e)
        })?;

    Ok(Json(outcome))
}

pub(crate) async fn retry_summary_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ServerResult<Json<CloseOutcome>> {
    let request_id = request_id(&headers);

    let outcome = state
        .manager
        .retry_summary(&session_id)
        .await
        .map_err(|e| {
            dual_error!("Failed to summarize session: {} - request_id: {}", e, request_id);
            ServerError::from(e)
        })?;

    Ok(Json(outcome))
}

pub(crate) async fn memory_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let memory = state.manager.memory_snapshot().await;
    Json(serde_json::json!({
        "mode": memory.get_mode(),
        "accumulated_summary": memory.get_summary(),
        "summaries_folded": memory.summaries_folded(),
        "updated_at": memory.updated_at(),
    }))
}

pub(crate) async fn memory_mode_handler(
    State(state): State<Arc<AppState>>,
) -> Json<MemoryModeResponse> {
    Json(MemoryModeResponse {
        mode: state.manager.memory_mode().await,
    })
}

pub(crate) async fn set_memory_mode_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MemoryModeRequest>,
) -> ServerResult<Json<MemoryModeResponse>> {
    let mode: MemoryMode = request
        .mode
        .parse()
        .map_err(|e: anyhow::Error| ServerError::BadRequest(e.to_string()))?;

    state.manager.set_memory_mode(mode).await;

    Ok(Json(MemoryModeResponse { mode }))
}

pub(crate) async fn clear_memory_handler(
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    state.manager.clear_memory().await;
    Json(serde_json::json!({ "cleared": true }))
}

pub(crate) async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<MemoryStats> {
    Json(state.manager.stats().await)
}

pub(crate) async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let gateway = state.manager.gateway();
    let connected = gateway.check_connection().await;

    Json(serde_json::json!({
        "status": "ok",
        "service": "llama-recall",
        "gateway": {
            "model": gateway.model(),
            "connected": connected,
        }
    }))
}
