use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Blocked,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 422 => Self::Validation,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the message service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct ApiException {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiException {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.code, ErrorCode::RateLimited | ErrorCode::Internal)
    }
}

impl From<ApiError> for ApiException {
    fn from(value: ApiError) -> Self {
        Self {
            code: value.code,
            message: value.message,
        }
    }
}

/// Rejection of an inbound stream frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("malformed `{event}` payload: {reason}")]
    Payload { event: &'static str, reason: String },
}

impl ProtocolError {
    pub fn payload(event: &'static str, reason: impl ToString) -> Self {
        Self::Payload {
            event,
            reason: reason.to_string(),
        }
    }
}
