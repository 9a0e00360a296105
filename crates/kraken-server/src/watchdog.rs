// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Watchdog: enforces job, run and agent deadlines.
//!
//! Jobs are checked on a short period. Runs, agents, the cloud fleet and
//! the cache buckets share a longer one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kraken_core::model::{CompletionStatus, DEFAULT_JOB_TIMEOUT, DEFAULT_RUN_TIMEOUT, RunState};
use kraken_core::persistence::RunRecord;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::ServerContext;
use crate::error::Result;
use crate::jobs;
use crate::objstore::CACHE_LIFETIME;

/// Configuration for the watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Period of the job deadline check.
    pub jobs_interval: Duration,
    /// Period of the run, agent, fleet and cache checks.
    pub slow_interval: Duration,
    /// Agents not seen for this long are disabled.
    pub agent_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            jobs_interval: Duration::from_secs(5),
            slow_interval: Duration::from_secs(30),
            agent_timeout: kraken_core::model::AGENT_TIMEOUT,
        }
    }
}

fn chrono_secs(secs: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs)
}

/// Deadline of a run: its start plus the schema `timeout`, or the default.
pub fn run_deadline(run: &RunRecord, schema: &Value) -> DateTime<Utc> {
    let timeout = schema
        .get("timeout")
        .and_then(Value::as_i64)
        .filter(|t| *t > 0)
        .unwrap_or(DEFAULT_RUN_TIMEOUT.as_secs() as i64);
    run.started.unwrap_or(run.created) + chrono_secs(timeout)
}

/// Background deadline enforcer.
pub struct Watchdog {
    ctx: ServerContext,
    config: WatchdogConfig,
    shutdown: Arc<Notify>,
}

impl Watchdog {
    pub fn new(ctx: ServerContext, config: WatchdogConfig) -> Self {
        Self {
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            jobs_interval_secs = self.config.jobs_interval.as_secs(),
            slow_interval_secs = self.config.slow_interval.as_secs(),
            agent_timeout_secs = self.config.agent_timeout.as_secs(),
            "Watchdog started"
        );
        let mut jobs_tick = tokio::time::interval(self.config.jobs_interval);
        let mut slow_tick = tokio::time::interval(self.config.slow_interval);
        jobs_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        slow_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Watchdog received shutdown signal");
                    break;
                }

                _ = jobs_tick.tick() => {
                    if let Err(e) = self.check_jobs(Utc::now()).await {
                        error!(error = %e, "Job deadline check failed");
                    }
                }

                _ = slow_tick.tick() => {
                    self.slow_pass(Utc::now()).await;
                }
            }
        }

        info!("Watchdog stopped");
    }

    async fn slow_pass(&self, now: DateTime<Utc>) {
        if let Err(e) = self.check_runs(now).await {
            error!(error = %e, "Run deadline check failed");
        }
        if let Err(e) = self.check_agents(now).await {
            error!(error = %e, "Agent liveness check failed");
        }
        match self.ctx.fleet.sweep_all(now).await {
            Ok(report) => debug!(?report, "Cloud fleet swept"),
            Err(e) => error!(error = %e, "Cloud fleet sweep failed"),
        }
        if let Err(e) = self.ctx.objstore.sweep_caches(CACHE_LIFETIME).await {
            error!(error = %e, "Cache sweep failed");
        }
    }

    /// Cancel assigned jobs past their timeout. Returns how many were canceled.
    pub async fn check_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut canceled = 0;
        for job in self.ctx.persistence.list_assigned_jobs().await? {
            let Some(assigned) = job.assigned else {
                continue;
            };
            let timeout = if job.timeout > 0 {
                job.timeout as i64
            } else {
                DEFAULT_JOB_TIMEOUT.as_secs() as i64
            };
            if now - assigned <= chrono_secs(timeout) {
                continue;
            }
            let note = format!("time {}s for job expired", timeout);
            match jobs::cancel_job(&self.ctx, job.id, &note, CompletionStatus::JobTimeout).await {
                Ok(true) => canceled += 1,
                Ok(false) => {}
                Err(e) => error!(job_id = job.id, error = %e, "Failed to time out job"),
            }
        }
        if canceled > 0 {
            info!(canceled, "Timed out jobs canceled");
        }
        Ok(canceled)
    }

    /// Cancel runs past their deadline. Returns how many were canceled.
    pub async fn check_runs(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut canceled = 0;
        for run in self.ctx.persistence.list_runs_in_progress().await? {
            if run.state != RunState::InProgress {
                continue;
            }
            let Some(stage) = self.ctx.persistence.get_stage(run.stage_id).await? else {
                warn!(run_id = run.id, stage_id = run.stage_id, "Run of a missing stage");
                continue;
            };
            let deadline = run_deadline(&run, &stage.schema);
            if now <= deadline {
                continue;
            }
            let note = format!("run {} timed out, deadline was: {}", run.id, deadline.to_rfc3339());
            match jobs::cancel_run(&self.ctx, run.id, &note, CompletionStatus::ServerTimeout).await {
                Ok(_) => canceled += 1,
                Err(e) => error!(run_id = run.id, error = %e, "Failed to time out run"),
            }
        }
        Ok(canceled)
    }

    /// Disable agents not seen within the agent timeout and release their
    /// jobs. Returns how many agents were handled.
    pub async fn check_agents(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = chrono::Duration::from_std(self.config.agent_timeout)
            .unwrap_or_else(|_| chrono_secs(300));
        let stale = self.ctx.persistence.list_stale_agents(now - timeout).await?;
        let status = format!(
            "agent was not seen for last {} minutes, disabled",
            self.config.agent_timeout.as_secs() / 60
        );
        for agent in &stale {
            if !agent.disabled {
                self.ctx.persistence.disable_agent(agent.id, &status).await?;
                info!(agent_id = agent.id, address = %agent.address, "Unseen agent disabled");
            }
            if let Some(job_id) = agent.job_id {
                let note = format!("agent {} was not seen, job aborted", agent.address);
                if let Err(e) =
                    jobs::cancel_job(&self.ctx, job_id, &note, CompletionStatus::ServerTimeout).await
                {
                    error!(agent_id = agent.id, job_id, error = %e, "Failed to release job of unseen agent");
                    continue;
                }
                self.ctx.persistence.clear_agent_job(agent.id).await?;
            }
        }
        Ok(stale.len())
    }
}
