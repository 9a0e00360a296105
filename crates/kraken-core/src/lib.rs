// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kraken Core - domain model and persistence for Kraken CI
//!
//! This crate holds everything the server and its background workers share:
//! the entity enums and records, the transactional persistence facade, the
//! coalescing rule of the work queue and the log store client.
//!
//! # Entity tree
//!
//! ```text
//! Project ─┬─ Branch ─┬─ Stage ──────────────┐
//!          │          └─ Flow ── Run (stage) ─┴─ Job ─┬─ Step
//!          └─ Secret                                  ├─ TestCaseResult ── TestCase
//!                                                     └─ Issue
//!
//! AgentsGroup ── AgentAssignment ── Agent ◀──▶ Job (agent_used / job)
//! ```
//!
//! # Job lifecycle
//!
//! ```text
//! PREQUEUED ─▶ QUEUED ─▶ ASSIGNED ─▶ EXECUTING_FINISHED ─▶ COMPLETED
//!     └──────────┴──────────┴───────────────┴──────────────────▲
//!                        (cancel / timeout / config error)
//! ```
//!
//! Every transition is one call on [`persistence::Persistence`]; the PostgreSQL
//! backend runs each in a single transaction that also updates the agent row.
//!
//! # Modules
//!
//! - [`model`]: state enums, completion causes and protocol constants
//! - [`persistence`]: the `Persistence` trait, PostgreSQL and in-memory backends
//! - [`queue`]: admission rule of the coalescing work queue
//! - [`logstore`]: append-only log rows (ClickHouse over HTTP)
//! - [`migrations`]: embedded SQL migrations

/// Error type shared by the persistence facade.
pub mod error;

/// Database migrations for kraken-core.
pub mod migrations;

/// Entity enums, constants and executor kinds.
pub mod model;

/// Persistence trait and backends.
pub mod persistence;

/// Coalescing admission for background tasks.
pub mod queue;

/// Structured log sink.
pub mod logstore;

pub use error::{CoreError, Result};
