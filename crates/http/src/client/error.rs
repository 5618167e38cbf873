//! Client error types

use crate::types::ErrorBody;
use thiserror::Error;

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    /// Login rejected by the backend (4xx)
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Login could not reach a healthy backend (network failure or 5xx)
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Refresh failed or the replayed call was still unauthorized
    #[error("Session expired, please log in again")]
    SessionExpired,

    /// 401 on a call that does not carry the session token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Any other 4xx, passed through untouched
    #[error("Request rejected with status {status}: {message}")]
    Validation { status: u16, message: String },

    /// 5xx from a regular call
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Network or request error
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Durable session storage failed
    #[error("Session storage error: {0}")]
    Storage(String),
}

impl ClientError {
    /// Create error from HTTP status code
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 => Self::Unauthorized(message),
            code @ 400..=499 => Self::Validation {
                status: code,
                message,
            },
            code => Self::Server {
                status: code,
                message,
            },
        }
    }

    /// Whether the caller must send the user back through login
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// Whether no valid session backs the failed call
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::Unauthorized(_))
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Validation { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Unauthorized(_) => Some(401),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<farmreg_core::CoreError> for ClientError {
    fn from(err: farmreg_core::CoreError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Extract a human-readable message from an error response
pub(crate) async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let text = match response.text().await {
        Ok(text) if !text.trim().is_empty() => text,
        _ => return status.to_string(),
    };

    serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(ErrorBody::into_message)
        .unwrap_or(text)
}
