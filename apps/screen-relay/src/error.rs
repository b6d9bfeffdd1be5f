use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::telemetry::METRIC_POLL_ERRORS;

/// Errors surfaced to poll clients.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("sessionId required")]
    MissingSessionId,
    #[error("role must be 'host' or 'viewer', got '{0}'")]
    InvalidRole(String),
    #[error("invalid JSON: {0}")]
    InvalidPayload(String),
    #[error("host not registered for session {0}")]
    HostNotRegistered(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingSessionId
            | RelayError::InvalidRole(_)
            | RelayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            RelayError::HostNotRegistered(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::MissingSessionId => "missing_session_id",
            RelayError::InvalidRole(_) => "invalid_role",
            RelayError::InvalidPayload(_) => "invalid_payload",
            RelayError::HostNotRegistered(_) => "host_not_registered",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        metrics::counter!(
            METRIC_POLL_ERRORS,
            1,
            "reason" => self.metric_label()
        );
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
