//! Application error types. Transport-facing serialization happens at the
//! WebSocket boundary via `ClientFacingError`; the core never raises
//! observable errors for normal mutation or subscription calls.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed JSON, unknown message type, or an undecodable payload.
    #[error("parse error: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Short machine error code string (snake_case) used in client packets.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Parse(_) => "parse_error",
            AppError::Io(_) => "io_error",
        }
    }
}

/// Simplified client-facing error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFacingError {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ClientFacingError {
    fn from(err: AppError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
