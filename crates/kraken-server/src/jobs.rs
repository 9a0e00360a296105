// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job lifecycle transitions outside the scheduler.
//!
//! ```text
//! Assigned ──finish_job──▶ ExecutingFinished ──handle_job_completed──▶ Completed
//!     │                                                                  ▲
//!     └──────────────── cancel_job (watchdog, operator) ────────────────┘
//! ```
//!
//! Every transition here is idempotent: a replayed `job_completed` task or a
//! second cancel leaves the database unchanged.

use std::collections::HashSet;

use chrono::Utc;
use kraken_core::model::{CompletionStatus, JobState, MIN_JOB_TIMEOUT_SECS, StepStatus, TcResult};
use kraken_core::persistence::{JobRecord, NewJob, NewStep, NewTestResult, StepRecord};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::analyzer::timeouts::update_learned_timeout;
use crate::broker::Task;
use crate::cloud::Deployment;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::planner;

/// Share of the parent's timeout given to a job split off by `dispatch-tests`.
const SPLIT_TIMEOUT_RATIO: f64 = 0.6;

async fn load_job(ctx: &ServerContext, job_id: i64) -> Result<JobRecord> {
    ctx.persistence
        .get_job(job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
}

/// Completion status implied by the reported step results.
///
/// The first erroring step decides; its `reason` tells timeouts and tool
/// exceptions apart from plain failures.
pub fn completion_status_from_steps(steps: &[StepRecord]) -> CompletionStatus {
    let Some(failed) = steps.iter().find(|s| s.status == StepStatus::Error) else {
        return CompletionStatus::AllOk;
    };
    match failed.result.get("reason").and_then(Value::as_str) {
        Some("job-timeout") => CompletionStatus::JobTimeout,
        Some("step-timeout" | "timeout") => CompletionStatus::StepTimeout,
        Some("exception") => CompletionStatus::AgentException,
        _ => CompletionStatus::AgentErrorReturned,
    }
}

/// Whether the reported steps leave nothing more to run.
pub fn steps_finished(steps: &[StepRecord]) -> bool {
    steps.iter().any(|s| s.status == StepStatus::Error)
        || steps.iter().all(|s| s.status.is_terminal())
}

/// Agent reported the last step of a job.
///
/// Moves the job to `ExecutingFinished`, frees the agent, retires a cloud
/// agent whose jobs quota is used up and hands the job to the analyzer.
/// Returns false when the job was no longer assigned.
pub async fn finish_job(ctx: &ServerContext, job_id: i64, agent_id: i64) -> Result<bool> {
    if !ctx.persistence.finish_job_execution(job_id, Utc::now()).await? {
        debug!(job_id, "Job not assigned anymore, finish ignored");
        return Ok(false);
    }
    info!(job_id, agent_id, "Job execution finished");

    if ctx.fleet.retire_if_quota_reached(agent_id).await? {
        ctx.broker.enqueue(Task::DestroyMachine { agent_id }).await?;
    } else {
        ctx.wake_scheduler();
    }
    ctx.broker.enqueue(Task::JobCompleted { job_id }).await?;
    Ok(true)
}

/// Analyze a job that left the agent: derive its completion status, learn
/// its timeout and complete the run once every job is done.
pub async fn handle_job_completed(ctx: &ServerContext, job_id: i64) -> Result<()> {
    let job = load_job(ctx, job_id).await?;
    match job.state {
        JobState::ExecutingFinished => {
            let steps = ctx.persistence.list_job_steps(job_id).await?;
            let status = completion_status_from_steps(&steps);
            if ctx.persistence.complete_job(job_id, status, None, Utc::now()).await? {
                info!(job_id, status = status.as_str(), "Job completed");
                if let Some(job) = ctx.persistence.get_job(job_id).await? {
                    update_learned_timeout(ctx, &job).await?;
                }
            }
        }
        JobState::Completed => {
            debug!(job_id, "Job already completed");
        }
        state => {
            warn!(job_id, ?state, "Completion requested for a job still in flight");
            return Ok(());
        }
    }
    check_run_completion(ctx, job.run_id).await?;
    Ok(())
}

/// Complete the run when all of its non-covered jobs are completed.
///
/// Returns true when the run is (now) complete from the jobs' point of view.
pub async fn check_run_completion(ctx: &ServerContext, run_id: i64) -> Result<bool> {
    let jobs = ctx.persistence.list_run_jobs(run_id).await?;
    let pending = jobs
        .iter()
        .filter(|j| !j.covered && j.state != JobState::Completed)
        .count();
    if pending > 0 {
        debug!(run_id, pending, "Run still has jobs to complete");
        return Ok(false);
    }
    planner::complete_run(ctx, run_id, None).await?;
    Ok(true)
}

/// Force a job to `Completed`. The agent learns about it on its next call.
///
/// Returns false when the job was already completed.
pub async fn cancel_job(
    ctx: &ServerContext,
    job_id: i64,
    note: &str,
    status: CompletionStatus,
) -> Result<bool> {
    if !ctx.persistence.complete_job(job_id, status, Some(note), Utc::now()).await? {
        return Ok(false);
    }
    info!(job_id, status = status.as_str(), note, "Job canceled");
    ctx.broker.enqueue(Task::JobCompleted { job_id }).await?;
    ctx.wake_scheduler();
    Ok(true)
}

/// Cancel every unfinished job of a run and complete the run with `note`.
///
/// Returns the number of jobs canceled.
pub async fn cancel_run(
    ctx: &ServerContext,
    run_id: i64,
    note: &str,
    status: CompletionStatus,
) -> Result<usize> {
    let mut canceled = 0;
    for job in ctx.persistence.list_run_jobs(run_id).await? {
        if job.covered || job.state == JobState::Completed {
            continue;
        }
        if ctx.persistence.complete_job(job.id, status, Some(note), Utc::now()).await? {
            canceled += 1;
        }
    }
    planner::complete_run(ctx, run_id, Some(note)).await?;
    if canceled > 0 {
        ctx.wake_scheduler();
    }
    info!(run_id, canceled, note, "Run canceled");
    Ok(canceled)
}

/// Operator rerun: cover a completed job and queue a fresh clone.
pub async fn rerun_job(ctx: &ServerContext, job_id: i64) -> Result<JobRecord> {
    let clone = ctx.persistence.rerun_job(job_id, Utc::now()).await?;
    info!(job_id, new_job_id = clone.id, run_id = clone.run_id, "Job rerun");

    if let Some(group_id) = clone.agents_group_id {
        let group = ctx.persistence.get_agents_group(group_id).await?;
        if group.as_ref().and_then(Deployment::of_group).is_some() {
            ctx.broker
                .enqueue(Task::SpawnNewAgents { agents_group_id: group_id })
                .await?;
        }
    }
    ctx.wake_scheduler();
    Ok(clone)
}

fn with_tests(fields: &Value, tests: &[String]) -> Value {
    let mut fields = fields.as_object().cloned().unwrap_or_default();
    fields.insert("tests".to_string(), json!(tests));
    Value::Object(fields)
}

fn not_run(tests: &[String]) -> Vec<NewTestResult> {
    tests
        .iter()
        .map(|name| NewTestResult {
            test_name: name.clone(),
            result: TcResult::NotRun,
            cmd_line: None,
            values: None,
        })
        .collect()
}

/// Split a collected test list between this job and a new sibling job.
///
/// Returns the tests the calling agent should run. Duplicate names reject
/// the whole list. A single test or a step without `autosplit` keeps the
/// full list here; otherwise the first half stays and the rest goes to a
/// sibling queued in the same run, group and system.
pub async fn dispatch_tests(
    ctx: &ServerContext,
    job_id: i64,
    step_idx: i32,
    tests: &[String],
) -> Result<Vec<String>> {
    let unique: HashSet<&str> = tests.iter().map(String::as_str).collect();
    if unique.len() != tests.len() {
        warn!(job_id, step_idx, "Duplicate test names reported, nothing dispatched");
        return Ok(Vec::new());
    }

    let job = load_job(ctx, job_id).await?;
    let steps = ctx.persistence.list_job_steps(job_id).await?;
    let step = steps
        .iter()
        .find(|s| s.idx == step_idx)
        .ok_or_else(|| Error::NotFound(format!("step {} of job {}", step_idx, job_id)))?;
    let autosplit = step.fields.get("autosplit").and_then(Value::as_bool).unwrap_or(false);

    if tests.len() <= 1 || !autosplit {
        ctx.persistence.record_test_results(job_id, step.tool_id, &not_run(tests)).await?;
        ctx.persistence
            .update_step_fields(job_id, step_idx, &with_tests(&step.fields, tests))
            .await?;
        debug!(job_id, step_idx, tests = tests.len(), "Tests dispatched without split");
        return Ok(tests.to_vec());
    }

    let (mine, theirs) = tests.split_at(tests.len() / 2);
    let timeout = ((job.timeout as f64 * SPLIT_TIMEOUT_RATIO) as i32).max(MIN_JOB_TIMEOUT_SECS);
    let sibling = NewJob {
        run_id: job.run_id,
        name: job.name.clone(),
        agents_group_id: job.agents_group_id,
        system_id: job.system_id,
        timeout,
        state: JobState::Queued,
        completion_status: None,
        notes: None,
        steps: steps
            .iter()
            .map(|s| NewStep {
                tool_id: s.tool_id,
                fields_raw: s.fields_raw.clone(),
                fields: if s.idx == step_idx {
                    with_tests(&s.fields, theirs)
                } else {
                    s.fields.clone()
                },
                fields_masked: s.fields_masked.clone(),
            })
            .collect(),
    };
    let sibling = ctx.persistence.create_job(&sibling, Utc::now()).await?;
    ctx.persistence.record_test_results(sibling.id, step.tool_id, &not_run(theirs)).await?;

    ctx.persistence.record_test_results(job_id, step.tool_id, &not_run(mine)).await?;
    ctx.persistence
        .update_step_fields(job_id, step_idx, &with_tests(&step.fields, mine))
        .await?;

    info!(
        job_id,
        sibling_job_id = sibling.id,
        kept = mine.len(),
        moved = theirs.len(),
        "Tests split into a new job"
    );
    ctx.wake_scheduler();
    Ok(mine.to_vec())
}
