// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kraken Server - the control plane of Kraken CI
//!
//! Turns repository events and timers into flows, expands each stage schema
//! into jobs, hands jobs to agents, collects their results and computes the
//! test and issue history.
//!
//! # Architecture
//!
//! ```text
//!   Git hosting ──webhook──┐            Agents ──POST /backend──┐
//!                          ▼                                    ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        kraken-server (HTTP)                          │
//! │   webhooks ── badges ── backend (get-job, step-result, sys-info ...) │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │ enqueue                          │ wake
//!          ▼                                  ▼
//! ┌─────────────────┐   ┌───────────┐   ┌───────────┐   ┌──────────────┐
//! │  broker worker  │   │  planner  │   │ scheduler │   │   watchdog   │
//! │ (tasks table)   │   │  triggers │   │ job→agent │   │  timeouts    │
//! └─────────────────┘   └───────────┘   └───────────┘   └──────────────┘
//!          │                  │               │                 │
//!          ▼                  ▼               ▼                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │               PostgreSQL (kraken-core persistence)                    │
//! └──────────────────────────────────────────────────────────────────────┘
//!                     ClickHouse (step and server logs)
//! ```
//!
//! # Run lifecycle
//!
//! | Event | Effect |
//! |-------|--------|
//! | flow triggered | a run per root stage, jobs prequeued |
//! | schema evaluated | jobs queued, scheduler woken |
//! | step result | results and issues stored, job finished when all steps are |
//! | job completed | run completion checked, analysis enqueued |
//! | run analyzed | counters, regressions and fixes, children triggered |

/// Run and results analysis: counters, history, issue diffs, notifications.
pub mod analyzer;

/// Agent backend: the request/response protocol spoken by agents.
pub mod backend;

/// Branch badges and CCTray feed.
pub mod badges;

/// Background task broker backed by the tasks table.
pub mod broker;

/// Cloud providers and the agent fleet manager.
pub mod cloud;

/// Server configuration loaded from environment variables.
pub mod config;

/// Shared state handed to handlers and background loops.
pub mod context;

/// Error types for server operations.
pub mod error;

/// Job lifecycle transitions.
pub mod jobs;

/// Filesystem object store for artifacts, caches and repository bundles.
pub mod objstore;

/// Flow and run creation, stage triggers.
pub mod planner;

pub mod process;

/// Embeddable runtime for kraken-server.
pub mod runtime;

/// Scheduler binding queued jobs to idle agents.
pub mod scheduler;

/// Stage schema evaluation, substitution and validation.
pub mod schema;

/// HTTP router and listener.
pub mod server;

/// Run artifacts, user data and agent object transfer.
pub mod storage;

/// Broker task dispatch.
pub mod tasks;

/// Deadline enforcement for jobs, runs and agents.
pub mod watchdog;

/// Repository hosting webhooks.
pub mod webhooks;

pub use config::Config;
pub use error::{Error, Result};
