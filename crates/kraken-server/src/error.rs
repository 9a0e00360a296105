// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kraken-server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Persistence facade failed.
    #[error("Core error: {0}")]
    Core(#[from] kraken_core::CoreError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Workflow schema could not be evaluated or validated.
    #[error("Schema error: {0}")]
    Schema(#[from] crate::schema::SchemaError),

    /// Cloud provider call failed.
    #[error("Cloud error: {0}")]
    Cloud(#[from] crate::cloud::CloudError),

    /// Referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Caller is not allowed to use the endpoint.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the broker should retry the task that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Core(e) => e.is_transient(),
            Self::Database(_) | Self::Io(_) | Self::Cloud(_) => true,
            _ => false,
        }
    }

    /// HTTP status reported to clients of the server endpoints.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) | Self::Json(_) | Self::Schema(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, axum::Json(json!({"error": self.to_string()}))).into_response()
    }
}

/// Result type using the server Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use kraken_core::CoreError;

    #[test]
    fn test_retryable_classification() {
        let transient: Error = CoreError::DatabaseError {
            operation: "select".into(),
            details: "reset".into(),
        }
        .into();
        assert!(transient.is_retryable());
        assert!(!Error::NotFound("job 1".into()).is_retryable());
        assert!(!Error::from(CoreError::not_found("run", 3)).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::NotFound("branch 9".into()).into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::InvalidRequest("bad signature".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Forbidden("agent".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(Error::Other("boom".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
