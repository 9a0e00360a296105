// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow schema of a stage.
//!
//! A stage's schema code is a minijinja template that renders the stage tree
//! as JSON:
//!
//! ```text
//! {% macro stage(ctx) %}
//! {
//!   "parent": "root",
//!   "triggers": {"parent": true},
//!   "parameters": [],
//!   "configs": [],
//!   "jobs": [{
//!     "name": "build",
//!     "steps": [{"tool": "shell", "cmd": "make build-#{KK_FLOW_SEQ}"}],
//!     "environments": [{"system": "ubuntu:22.04", "executor": "docker",
//!                       "agents_group": "all", "config": "default"}]
//!   }]
//! }
//! {% endmacro %}
//! ```
//!
//! Evaluation ([`eval`]) renders the template, the result is checked against
//! the workflow contract ([`validate`]) and step fields are later expanded by
//! `#{...}` substitution ([`subst`]). Schemas can also live in a git
//! repository ([`repo`]).

pub mod eval;
pub mod repo;
pub mod subst;
pub mod validate;

use thiserror::Error;

pub use eval::{SchemaContext, evaluate};
pub use subst::{Substitution, substitute};
pub use validate::{check_schema, parse_tool_ref, validate_workflow};

/// Errors of schema evaluation and validation.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The template failed to compile or render.
    #[error("schema code error: {0}")]
    Render(String),

    /// The rendered text is not JSON.
    #[error("schema did not render to JSON: {0}")]
    Parse(String),

    /// The tree violates the workflow contract.
    #[error("schema is invalid: {0}")]
    Invalid(String),

    /// A step references a tool that is not registered.
    #[error("job {job}, step {step}: tool '{tool}' not found")]
    MissingTool {
        /// 1-based job index.
        job: usize,
        /// 0-based step index.
        step: usize,
        tool: String,
    },

    /// Step fields do not match the tool's fields schema.
    #[error("job {job}, step {step}: {reason}")]
    InvalidStepFields {
        job: usize,
        step: usize,
        reason: String,
    },

    /// Cloning or reading the schema repository failed.
    #[error("schema repository error: {0}")]
    Repo(String),
}

impl From<minijinja::Error> for SchemaError {
    fn from(e: minijinja::Error) -> Self {
        let mut msg = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(inner) = source {
            msg.push_str(": ");
            msg.push_str(&inner.to_string());
            source = inner.source();
        }
        Self::Render(msg)
    }
}
