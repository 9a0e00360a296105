// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kraken-core.
//!
//! A single error type for everything behind the [`Persistence`](crate::persistence::Persistence)
//! facade. Each variant carries a stable code so callers (the agent backend, the
//! broker retry path) can decide how to react without matching on messages.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence facade and domain helpers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Entity was not found.
    NotFound {
        /// Entity kind, e.g. `job`.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Entity exists but is in a state that forbids the operation.
    InvalidState {
        /// Entity kind.
        entity: &'static str,
        /// Identifier.
        id: String,
        /// Human readable reason.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A uniqueness constraint or concurrent update collided.
    Conflict {
        /// Description of the collision.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The log store rejected a request or was unreachable.
    LogStore {
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`CoreError::InvalidState`].
    pub fn invalid_state(entity: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Conflict { .. } => "CONFLICT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::LogStore { .. } => "LOG_STORE_ERROR",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError { .. } | Self::Conflict { .. } | Self::LogStore { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            Self::InvalidState { entity, id, reason } => {
                write!(f, "{} '{}' is in invalid state: {}", entity, id, reason)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error on '{}': {}", field, message)
            }
            Self::Conflict { details } => write!(f, "Conflict: {}", details),
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::LogStore { details } => write!(f, "Log store error: {}", details),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row",
                id: String::new(),
            },
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict {
                details: db.message().to_string(),
            },
            other => Self::DatabaseError {
                operation: "query".to_string(),
                details: other.to_string(),
            },
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationError {
            field: "json".to_string(),
            message: err.to_string(),
        }
    }
}
