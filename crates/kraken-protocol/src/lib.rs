// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kraken Protocol - agent and tool wire formats
//!
//! Two channels are described here:
//!
//! ```text
//! ┌──────────────┐   HTTP POST /backend (JSON)    ┌──────────────┐
//! │ kraken-agent │ ─────────────────────────────▶ │ kraken-server│
//! │              │ ◀───────────────────────────── │              │
//! └──────────────┘        AgentResponse           └──────────────┘
//!        ▲
//!        │ TCP, one JSON object per line (StepResult)
//! ┌──────────────┐
//! │    kktool    │  (runs inside the execution context)
//! └──────────────┘
//! ```
//!
//! # Agent messages
//!
//! | `msg` | Payload | Response keys |
//! |-------|---------|---------------|
//! | `get-job` | - | `job`, `cfg`, `version` |
//! | `step-result` | `job_id`, `step_idx`, `result` | `cancel`, `timeout` |
//! | `dispatch-tests` | `job_id`, `step_idx`, `tests` | `tests`, `cancel` |
//! | `sys-info` | `info` | `agent_id` |
//! | `keep-alive` | `job_id?` | `cancel` |
//!
//! Any message from an unknown or unauthorized agent is answered with
//! `{"unauthorized": true}`.

pub mod frame;
pub mod messages;

pub use frame::{FrameError, FramedStream, MAX_LINE_SIZE, read_frame, write_frame};
pub use messages::{
    AgentCfg, AgentMessage, AgentRequest, AgentResponse, Capabilities, HostInfo, IssueEntry,
    JobDescriptor, StepDescriptor, StepPredicate, StepResult, StepState, TestResultEntry,
    ToolCommand,
};
