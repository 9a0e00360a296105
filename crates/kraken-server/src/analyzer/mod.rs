// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion analysis of runs.
//!
//! ```text
//! run completed ──▶ analyze_run ──▶ counters, following stages, flow state
//!                        │
//!                        ▼
//!            analyze_results_history ──▶ result/issue history, Processed
//!                        │
//!                        └──▶ next CI run of the stage, if already completed
//! ```
//!
//! Both steps are idempotent and may be replayed by the broker.

pub mod history;
pub mod issues;
pub mod timeouts;

use chrono::{DateTime, Utc};
use kraken_core::logstore::{LogRecord, LogTable};
use kraken_core::model::{FlowKind, FlowState, RunState, TcResult};
use kraken_core::persistence::{FlowRecord, HistoryCounters, RunCounters, RunRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::Task;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::planner;

/// Delay before re-checking a run whose predecessor is still running.
pub const POSTPONE_DELAY: chrono::Duration = chrono::Duration::seconds(30);

/// Settings group holding cached flow summaries.
pub const SUMMARY_GROUP: &str = "branch-summary";

/// Settings key of the summary of the last refreshed flow of a kind.
pub fn summary_key(branch_id: i64, kind: FlowKind) -> String {
    format!("{}-{}", branch_id, kind.as_flow_type().to_ascii_lowercase())
}

/// Settings key of the summary of the last completed flow of a kind.
pub fn completed_summary_key(branch_id: i64, kind: FlowKind) -> String {
    format!("{}-completed", summary_key(branch_id, kind))
}

/// Aggregated view of a flow served by badges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: i64,
    pub label: String,
    pub kind: String,
    pub completed: bool,
    pub created: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub runs: i32,
    /// Runs with at least one erroneous job.
    pub runs_errored: i32,
    pub jobs_total: i32,
    pub jobs_error: i32,
    pub tests_total: i32,
    pub tests_passed: i32,
    pub tests_not_run: i32,
    pub issues_total: i32,
    pub issues_new: i32,
    pub regr_cnt: i32,
    pub fix_cnt: i32,
}

impl FlowSummary {
    pub fn from_runs(flow: &FlowRecord, runs: &[RunRecord]) -> Self {
        let mut s = Self {
            flow_id: flow.id,
            label: flow.label.clone().unwrap_or_else(|| format!("{}", flow.id)),
            kind: flow.kind.as_flow_type().to_string(),
            completed: flow.state == FlowState::Completed,
            created: Some(flow.created),
            finished: flow.finished,
            ..Default::default()
        };
        for run in runs {
            s.runs += 1;
            if run.jobs_error > 0 {
                s.runs_errored += 1;
            }
            s.jobs_total += run.jobs_total;
            s.jobs_error += run.jobs_error;
            s.tests_total += run.tests_total;
            s.tests_passed += run.tests_passed;
            s.tests_not_run += run.tests_not_run;
            s.issues_total += run.issues_total;
            s.issues_new += run.issues_new;
            s.regr_cnt += run.regr_cnt;
            s.fix_cnt += run.fix_cnt;
        }
        s
    }
}

async fn load_run(ctx: &ServerContext, run_id: i64) -> Result<RunRecord> {
    ctx.persistence
        .get_run(run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))
}

async fn load_flow(ctx: &ServerContext, flow_id: i64) -> Result<FlowRecord> {
    ctx.persistence
        .get_flow(flow_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("flow {}", flow_id)))
}

/// Compute run counters, start following stages, complete the flow when
/// nothing runs anymore and schedule the history analysis.
pub async fn analyze_run(ctx: &ServerContext, run_id: i64) -> Result<RunCounters> {
    let run = load_run(ctx, run_id).await?;
    let mut counters = RunCounters::default();
    for job in ctx.persistence.list_run_jobs(run_id).await? {
        if job.covered {
            continue;
        }
        counters.jobs_total += 1;
        if job.completion_status.is_some_and(|s| s.is_error()) {
            counters.jobs_error += 1;
        }
        for result in ctx.persistence.list_job_results(job.id).await? {
            counters.tests_total += 1;
            match result.result {
                TcResult::Passed => counters.tests_passed += 1,
                TcResult::NotRun => counters.tests_not_run += 1,
                _ => {}
            }
        }
        counters.issues_total += ctx.persistence.list_job_issues(job.id).await?.len() as i32;
    }
    ctx.persistence.update_run_counters(run_id, &counters).await?;
    info!(
        run_id,
        jobs = counters.jobs_total,
        jobs_error = counters.jobs_error,
        tests = counters.tests_total,
        passed = counters.tests_passed,
        issues = counters.issues_total,
        "Run analyzed"
    );

    let run = RunRecord {
        jobs_total: counters.jobs_total,
        jobs_error: counters.jobs_error,
        ..run
    };
    if counters.jobs_error == 0 {
        let started = planner::trigger_following_stages(ctx, &run).await?;
        if started > 0 {
            info!(run_id, started, "Following stages started");
        }
    }

    let runs = ctx.persistence.list_flow_runs(run.flow_id).await?;
    if !runs.iter().any(|r| r.state == RunState::InProgress)
        && ctx.persistence.complete_flow(run.flow_id, Utc::now()).await?
    {
        info!(flow_id = run.flow_id, "Flow completed");
    }
    refresh_flow_summary(ctx, run.flow_id).await?;

    ctx.broker.enqueue(Task::AnalyzeResultsHistory { run_id }).await?;
    Ok(counters)
}

/// Analyze result and issue history of a completed run.
///
/// A CI run waits for the previous CI run of its stage; when that one is still
/// in progress the analysis is re-enqueued for later. Returns the counters, or
/// `None` when the analysis did not happen.
pub async fn analyze_results_history(
    ctx: &ServerContext,
    run_id: i64,
) -> Result<Option<HistoryCounters>> {
    let run = load_run(ctx, run_id).await?;
    if !run.state.is_finished() {
        debug!(run_id, state = ?run.state, "Run is not completed, history analysis skipped");
        return Ok(None);
    }
    let flow = load_flow(ctx, run.flow_id).await?;

    if flow.kind == FlowKind::Ci {
        let previous = ctx.persistence.previous_ci_run(run.stage_id, flow.created).await?;
        if let Some(prev) = previous.filter(|p| p.state == RunState::InProgress) {
            info!(run_id, previous_run_id = prev.id, "Previous run in progress, history analysis postponed");
            ctx.broker
                .enqueue_at(Task::AnalyzeResultsHistory { run_id }, Utc::now() + POSTPONE_DELAY)
                .await?;
            return Ok(None);
        }
    }

    let mut counters = HistoryCounters::default();
    for job in ctx.persistence.list_run_jobs(run_id).await? {
        if job.covered {
            continue;
        }
        let c = history::analyze_job_results(ctx, &job, &flow).await?;
        counters.new_cnt += c.new_cnt;
        counters.no_change_cnt += c.no_change_cnt;
        counters.regr_cnt += c.regr_cnt;
        counters.fix_cnt += c.fix_cnt;
        counters.issues_new += issues::analyze_job_issues(ctx, &job, &run, &flow).await?;
    }
    ctx.persistence.mark_run_processed(run_id, &counters, Utc::now()).await?;
    info!(
        run_id,
        new = counters.new_cnt,
        no_change = counters.no_change_cnt,
        regressions = counters.regr_cnt,
        fixes = counters.fix_cnt,
        issues_new = counters.issues_new,
        "Run history analyzed"
    );

    refresh_flow_summary(ctx, flow.id).await?;
    ctx.broker.enqueue(Task::NotifyAboutCompletedRun { run_id }).await?;

    if flow.kind == FlowKind::Ci {
        if let Some(next) = ctx.persistence.next_ci_run(run.stage_id, flow.created).await? {
            if next.state.is_finished() {
                ctx.broker
                    .enqueue(Task::AnalyzeResultsHistory { run_id: next.id })
                    .await?;
            }
        }
    }
    Ok(Some(counters))
}

/// Recompute and cache the summary of a flow for badges.
pub async fn refresh_flow_summary(ctx: &ServerContext, flow_id: i64) -> Result<FlowSummary> {
    let flow = load_flow(ctx, flow_id).await?;
    let runs = ctx.persistence.list_flow_runs(flow_id).await?;
    let summary = FlowSummary::from_runs(&flow, &runs);
    let value = serde_json::to_value(&summary)?;

    ctx.persistence
        .set_setting(SUMMARY_GROUP, &summary_key(flow.branch_id, flow.kind), &value)
        .await?;
    if summary.completed {
        let last = ctx
            .persistence
            .last_completed_flow(flow.branch_id, flow.kind)
            .await?;
        if last.is_some_and(|f| f.id == flow.id) {
            ctx.persistence
                .set_setting(SUMMARY_GROUP, &completed_summary_key(flow.branch_id, flow.kind), &value)
                .await?;
        }
    }
    debug!(flow_id, runs = summary.runs, "Flow summary refreshed");
    Ok(summary)
}

/// Summary of the last completed flow of a kind, from cache or computed.
pub async fn completed_flow_summary(
    ctx: &ServerContext,
    branch_id: i64,
    kind: FlowKind,
) -> Result<Option<FlowSummary>> {
    let cached = ctx
        .persistence
        .get_setting(SUMMARY_GROUP, &completed_summary_key(branch_id, kind))
        .await?;
    if let Some(value) = cached {
        match serde_json::from_value(value) {
            Ok(summary) => return Ok(Some(summary)),
            Err(e) => warn!(branch_id, error = %e, "Cached flow summary unreadable, recomputing"),
        }
    }
    let Some(flow) = ctx.persistence.last_completed_flow(branch_id, kind).await? else {
        return Ok(None);
    };
    let runs = ctx.persistence.list_flow_runs(flow.id).await?;
    Ok(Some(FlowSummary::from_runs(&flow, &runs)))
}

/// Run start/end event: a structured log line plus a row in the log store.
pub async fn notify_about_run(ctx: &ServerContext, run_id: i64, event: &str) -> Result<()> {
    let run = load_run(ctx, run_id).await?;
    let flow = load_flow(ctx, run.flow_id).await?;
    let message = match event {
        "start" => format!("run {} started", run.label.as_deref().unwrap_or("")),
        _ => format!(
            "run {} finished: {} jobs, {} errors, {} tests passed of {}, {} regressions, {} fixes",
            run.label.as_deref().unwrap_or(""),
            run.jobs_total,
            run.jobs_error,
            run.tests_passed,
            run.tests_total,
            run.regr_cnt,
            run.fix_cnt
        ),
    };
    info!(run_id, flow_id = flow.id, event, "{}", message);
    let record = LogRecord {
        time: Utc::now(),
        branch: flow.branch_id as u64,
        flow_kind: flow.kind as u8,
        flow: flow.id as u64,
        run: run.id as u64,
        service: "server/notify".to_string(),
        level: "INFO".to_string(),
        message,
        ..Default::default()
    };
    if let Err(e) = ctx.logstore.insert(LogTable::Logs, &[record]).await {
        warn!(run_id, error = %e, "Failed to store run notification");
    }
    Ok(())
}

#[cfg(test)]
mod tests;
