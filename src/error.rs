//! Error taxonomy
//!
//! Every fallible operation in the relay converges on [`RelayError`], a single
//! sum type that carries a stable machine code and the HTTP status it maps to.
//! Handlers return it directly; `IntoResponse` renders the wire shape
//! `{"error": "<MACHINE_CODE>", "message": "<text>"}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("missing or invalid x-server-key header")]
    Unauthorized,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} has already been finalized")]
    SessionCompleted(String),

    #[error("Expected {expected} chunks, received {received}")]
    IncompleteChunks { expected: u32, received: usize },

    #[error("{0}")]
    Decryption(String),

    #[error("git {op} failed: {message}")]
    Git { op: &'static str, message: String },

    #[error("Size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("File of {size} bytes exceeds the limit of {max}")]
    FileTooLarge { size: u64, max: u64 },

    #[error("SHA-256 digest does not match the uploaded data")]
    Sha256Mismatch,

    #[error("Destination already exists: {0}")]
    FileExists(String),

    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    /// Stable machine code reported in the error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionCompleted(_) => "SESSION_COMPLETED",
            Self::IncompleteChunks { .. } => "INCOMPLETE_CHUNKS",
            Self::Decryption(_) => "DECRYPTION_FAILED",
            Self::Git { .. } => "GIT_ERROR",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::Sha256Mismatch => "SHA256_MISMATCH",
            Self::FileExists(_) => "FILE_EXISTS",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_)
            | Self::IncompleteChunks { .. }
            | Self::Decryption(_)
            | Self::SizeMismatch { .. }
            | Self::FileTooLarge { .. }
            | Self::Sha256Mismatch => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionCompleted(_) | Self::FileExists(_) => StatusCode::CONFLICT,
            Self::Git { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        }
        (
            status,
            Json(json!({
                "error": self.code(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let cases: Vec<(RelayError, &str, StatusCode)> = vec![
            (
                RelayError::InvalidInput("bad".into()),
                "INVALID_INPUT",
                StatusCode::BAD_REQUEST,
            ),
            (
                RelayError::Unauthorized,
                "UNAUTHORIZED",
                StatusCode::UNAUTHORIZED,
            ),
            (
                RelayError::SessionNotFound("s1".into()),
                "SESSION_NOT_FOUND",
                StatusCode::NOT_FOUND,
            ),
            (
                RelayError::SessionCompleted("s1".into()),
                "SESSION_COMPLETED",
                StatusCode::CONFLICT,
            ),
            (
                RelayError::IncompleteChunks {
                    expected: 3,
                    received: 2,
                },
                "INCOMPLETE_CHUNKS",
                StatusCode::BAD_REQUEST,
            ),
            (
                RelayError::Decryption("bad tag".into()),
                "DECRYPTION_FAILED",
                StatusCode::BAD_REQUEST,
            ),
            (
                RelayError::Git {
                    op: "push",
                    message: "rejected".into(),
                },
                "GIT_ERROR",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                RelayError::FileExists("/data/x".into()),
                "FILE_EXISTS",
                StatusCode::CONFLICT,
            ),
            (
                RelayError::Internal("boom".into()),
                "INTERNAL_ERROR",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status);
        }
    }

    #[test]
    fn test_incomplete_chunks_message() {
        let err = RelayError::IncompleteChunks {
            expected: 3,
            received: 2,
        };
        assert_eq!(err.to_string(), "Expected 3 chunks, received 2");
    }

    #[test]
    fn test_git_error_carries_operation() {
        let err = RelayError::Git {
            op: "bundle verify",
            message: "not a bundle".into(),
        };
        assert!(err.to_string().contains("bundle verify"));
    }
}
