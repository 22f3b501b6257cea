use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::memory::types::{GatewayError, SessionError, SummaryError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    GatewayTimeout(String),

    #[error("{0}")]
    BadGateway(String),
}

impl ServerError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, "invalid_state"),
            ServerError::GatewayTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "gateway_timeout"),
            ServerError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "gateway_error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        let body = serde_json::json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
            }
        });

        (status, Json(body)).into_response()
    }
}

impl From<GatewayError> for ServerError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Timeout(_) => ServerError::GatewayTimeout(error.to_string()),
            _ => ServerError::BadGateway(error.to_string()),
        }
    }
}

impl From<SessionError> for ServerError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::InvalidState { .. }
            | SessionError::NoActiveSession
            | SessionError::AlreadyActive(_) => ServerError::Conflict(error.to_string()),
            SessionError::NotFound(_) => ServerError::NotFound(error.to_string()),
            SessionError::Gateway(e) => e.into(),
            SessionError::SummaryFailure(SummaryError::Gateway(GatewayError::Timeout(_))) => {
                ServerError::GatewayTimeout(error.to_string())
            }
            SessionError::SummaryFailure(_) => ServerError::BadGateway(error.to_string()),
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
