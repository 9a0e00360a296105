// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kraken-agent.

use kraken_protocol::FrameError;
use thiserror::Error;

/// Agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration or command line.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request to the server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("Server returned {status}: {body}")]
    Server { status: u16, body: String },

    /// The server stayed unreachable through every retry.
    #[error("Server unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Callback socket framing failed.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Execution context could not be prepared or used.
    #[error("Execution error: {0}")]
    Exec(String),

    /// An operation ran past its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The tool misbehaved (bad command list, missing result, ...).
    #[error("Tool error: {0}")]
    Tool(String),
}

impl Error {
    /// Transient transport failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Error result reported to the server for a failure outside the tool.
    pub fn to_step_result(&self) -> kraken_protocol::StepResult {
        let reason = match self {
            Self::Timeout(_) => "timeout",
            _ => "exception",
        };
        kraken_protocol::StepResult::error(reason).with("msg", self.to_string())
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, Error>;
