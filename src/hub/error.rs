//! HTTP error responses for the hub

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::connection::PushError;
use super::ingest::SinkError;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug)]
pub enum HubError {
    /// Upgrade request without a credential
    MissingToken,

    /// Credential not known to the directory
    InvalidToken,

    /// REST request without a valid api token
    Unauthorized(&'static str),

    /// Agent not connected
    NotConnected(String),

    /// Agent's outbound queue is full
    QueueFull(String),

    InvalidRequest(String),

    Internal(String),
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            HubError::MissingToken => (StatusCode::BAD_REQUEST, "token required".to_string()),
            HubError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid token".to_string()),
            HubError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.to_string()),
            HubError::NotConnected(msg) => (StatusCode::NOT_FOUND, msg),
            HubError::QueueFull(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            HubError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HubError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<SinkError> for HubError {
    fn from(err: SinkError) -> Self {
        HubError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        HubError::Internal(err.to_string())
    }
}

impl From<PushError> for HubError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::NotConnected | PushError::Closed => HubError::NotConnected(err.to_string()),
            PushError::QueueFull => HubError::QueueFull(err.to_string()),
            PushError::Encode(e) => HubError::InvalidRequest(e.to_string()),
        }
    }
}
