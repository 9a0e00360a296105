// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kraken Agent - runs CI jobs handed out by the Kraken server
//!
//! The agent polls the server backend for jobs, prepares an execution
//! context for each (local, Docker, LXD or Kubernetes) and runs the job's
//! steps through tools. Tools are separate processes; they report back over
//! a TCP callback socket with newline-delimited JSON frames.
//!
//! ```text
//!   kraken-server ◄──── POST /backend ────┐
//!                                         │
//! ┌───────────────────────────────────────┴──────────────────┐
//! │ agent loop ── job runner ── coordinator (callback server) │
//! └─────────────────────┬─────────────────────▲───────────────┘
//!                       │ spawn               │ frames
//!                       ▼                     │
//!        execution context ── kktool / kraken_<tool>
//! ```

/// Main loop: registration, polling and configuration updates.
pub mod agent;

/// Callback server relaying tool frames to the server.
pub mod callback;

pub mod cli;

/// HTTP client for the server backend.
pub mod client;

pub mod config;
pub mod error;

/// Execution contexts: local, docker, lxd and k8s.
pub mod exec;

/// Host inspection and the agent's own address.
pub mod host;

/// systemd service installation.
pub mod install;

/// Running a job's steps.
pub mod jobber;

/// Log shipping to the ClickHouse proxy.
pub mod logship;

pub mod masking;

/// Tool resolution: host programs and kktool.
pub mod tools;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{Error, Result};
