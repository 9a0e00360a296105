// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent endpoint: one request envelope, one flat response.
//!
//! ```text
//! request ──▶ resolve agent by address ──▶ authorized? ──▶ get-job | step-result
//!                  │ unknown / deleted          │ no          dispatch-tests
//!                  ▼                            ▼             sys-info | keep-alive
//!         register as unauthorized      {unauthorized: true}
//! ```
//!
//! A job completed server-side (watchdog, operator) is detected on the next
//! call about it: `get-job` returns no job, the other kinds answer
//! `{cancel: true}`.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use kraken_core::model::{IssueType, JobState, SecretKind, StepStatus, TcResult};
use kraken_core::persistence::{
    AgentRecord, FlowRecord, JobRecord, NewIssue, NewTestResult, StepRecord,
};
use kraken_protocol::messages::{
    AgentCfg, AgentMessage, AgentRequest, AgentResponse, HostInfo, JobDescriptor, StepDescriptor,
    StepResult, StepState,
};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::cloud::is_cloud_agent;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::jobs;
use crate::planner::normalize_repo_url;
use crate::schema::validate::parse_tool_ref;
use crate::storage;

/// Share of the remaining job time announced to the agent.
const TIMEOUT_HINT_RATIO: f64 = 0.9;

/// Longest issue message kept.
const ISSUE_MESSAGE_LIMIT: usize = 511;

/// Seconds the agent may still spend on a job, slightly reduced.
pub fn left_time(job: &JobRecord, now: DateTime<Utc>) -> i64 {
    let slip = job.assigned.map_or(0, |a| (now - a).num_seconds());
    ((job.timeout as i64 - slip) as f64 * TIMEOUT_HINT_RATIO) as i64
}

fn step_state(status: StepStatus) -> StepState {
    match status {
        StepStatus::NotStarted => StepState::NotStarted,
        StepStatus::InProgress => StepState::InProgress,
        StepStatus::Done => StepState::Done,
        StepStatus::Error => StepState::Error,
        StepStatus::Skipped => StepState::Skipped,
    }
}

fn step_status(state: StepState) -> StepStatus {
    match state {
        StepState::NotStarted => StepStatus::NotStarted,
        StepState::InProgress => StepStatus::InProgress,
        StepState::Done => StepStatus::Done,
        StepState::Error => StepStatus::Error,
        StepState::Skipped => StepStatus::Skipped,
    }
}

/// Result code reported by tools; unknown codes count as errors.
fn tc_result(code: i32) -> TcResult {
    match code {
        0 => TcResult::NotRun,
        1 => TcResult::Passed,
        2 => TcResult::Failed,
        4 => TcResult::Disabled,
        5 => TcResult::Unsupported,
        _ => TcResult::Error,
    }
}

/// Serve one agent request.
///
/// `peer` is the remote address, used when the agent does not name itself.
pub async fn serve_agent_request(
    ctx: &ServerContext,
    request: AgentRequest,
    peer: Option<IpAddr>,
) -> Result<AgentResponse> {
    let address = request
        .address
        .filter(|a| !a.is_empty())
        .or_else(|| peer.map(|ip| ip.to_string()))
        .ok_or_else(|| Error::InvalidRequest("agent address is missing".to_string()))?;
    let now = Utc::now();
    debug!(address = %address, msg = request.message.kind(), "Agent request");

    let agent = match ctx.persistence.find_agent_by_address(&address).await? {
        Some(agent) if agent.deleted.is_none() => agent,
        _ => {
            warn!(address = %address, "Unknown agent");
            let agent = ctx.persistence.register_unknown_agent(&address, now).await?;
            info!(agent_id = agent.id, address = %address, "Agent registered as unauthorized");
            return Ok(AgentResponse::unauthorized());
        }
    };
    ctx.persistence.touch_agent(agent.id, now).await?;

    let agent = if agent.authorized {
        agent
    } else if is_cloud_agent(&agent) {
        // machines spawned by the fleet manager are trusted on first contact
        ctx.persistence.set_agent_flags(agent.id, true, false).await?;
        info!(agent_id = agent.id, address = %address, "Cloud agent authorized");
        AgentRecord {
            authorized: true,
            disabled: false,
            ..agent
        }
    } else {
        warn!(agent_id = agent.id, address = %address, "Unauthorized agent");
        return Ok(AgentResponse::unauthorized());
    };

    match request.message {
        AgentMessage::GetJob => get_job(ctx, &agent, now).await,
        AgentMessage::StepResult {
            job_id,
            step_idx,
            result,
        } => step_result(ctx, &agent, job_id, step_idx, result, now).await,
        AgentMessage::DispatchTests {
            job_id,
            step_idx,
            tests,
        } => dispatch_tests(ctx, &agent, job_id, step_idx, &tests).await,
        AgentMessage::SysInfo { info } => sys_info(ctx, &agent, info).await,
        AgentMessage::KeepAlive { job_id } => keep_alive(ctx, &agent, job_id).await,
    }
}

/// Whether the agent is reporting on a job the server already completed.
///
/// Clears a stale back-reference on the way.
async fn completed_elsewhere(ctx: &ServerContext, agent: &AgentRecord, job_id: i64) -> Result<bool> {
    let Some(job) = ctx.persistence.get_job(job_id).await? else {
        return Ok(false);
    };
    if job.state != JobState::Completed || job.agent_used_id != Some(agent.id) {
        return Ok(false);
    }
    if agent.job_id == Some(job_id) {
        ctx.persistence.clear_agent_job(agent.id).await?;
    }
    info!(agent_id = agent.id, job_id, "Canceling job completed by the server");
    Ok(true)
}

fn base_response(ctx: &ServerContext) -> AgentResponse {
    AgentResponse {
        cfg: Some(AgentCfg {
            clickhouse_addr: ctx.settings.clickhouse_addr.clone(),
            extra: Map::new(),
        }),
        version: Some(ctx.settings.version.clone()),
        ..Default::default()
    }
}

async fn get_job(ctx: &ServerContext, agent: &AgentRecord, now: DateTime<Utc>) -> Result<AgentResponse> {
    let mut response = base_response(ctx);
    let Some(job_id) = agent.job_id else {
        return Ok(response);
    };
    let job = match ctx.persistence.get_job(job_id).await? {
        Some(job) if job.state != JobState::Completed => job,
        _ => {
            ctx.persistence.clear_agent_job(agent.id).await?;
            info!(agent_id = agent.id, job_id, "Unassigned canceled job from agent");
            return Ok(response);
        }
    };
    ctx.persistence.mark_job_started(job.id, now).await?;
    response.job = Some(job_descriptor(ctx, &job, now).await?);
    info!(agent_id = agent.id, job_id, "Job handed to agent");
    Ok(response)
}

/// Everything an agent needs to run a job.
pub async fn job_descriptor(
    ctx: &ServerContext,
    job: &JobRecord,
    now: DateTime<Utc>,
) -> Result<JobDescriptor> {
    let run = ctx
        .persistence
        .get_run(job.run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("run {}", job.run_id)))?;
    let flow = ctx
        .persistence
        .get_flow(run.flow_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("flow {}", run.flow_id)))?;
    let branch = ctx
        .persistence
        .get_branch(flow.branch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("branch {}", flow.branch_id)))?;
    let system = match job.system_id {
        Some(id) => ctx.persistence.get_system(id).await?,
        None => None,
    };

    let mut steps = Vec::new();
    for step in ctx.persistence.list_job_steps(job.id).await? {
        steps.push(step_descriptor(ctx, &step, &flow, run.id).await?);
    }

    let secrets = ctx
        .persistence
        .list_project_secrets(branch.project_id)
        .await?
        .into_iter()
        .filter(|s| s.deleted.is_none())
        .filter_map(|s| {
            let key = match s.kind {
                SecretKind::Simple => "secret",
                SecretKind::SshKey => "key",
            };
            s.data.get(key).and_then(Value::as_str).map(str::to_string)
        })
        .filter(|v| !v.is_empty())
        .collect();

    let trigger_data = flow.trigger_data.clone().or_else(|| {
        let repo = run.repo_data.as_ref()?.as_array()?.first()?;
        let after = repo.pointer("/commits/0/id")?;
        Some(json!([{"repo": repo.get("repo")?, "after": after}]))
    });

    Ok(JobDescriptor {
        id: job.id,
        name: job.name.clone(),
        timeout: left_time(job, now),
        executor: system
            .as_ref()
            .map_or_else(|| "local".to_string(), |s| s.executor.clone()),
        system: system.as_ref().map(|s| s.name.clone()).unwrap_or_default(),
        system_id: job.system_id,
        branch_id: flow.branch_id,
        flow_kind: flow.kind as i32,
        flow_id: flow.id,
        run_id: run.id,
        steps,
        secrets,
        trigger_data,
    })
}

async fn step_descriptor(
    ctx: &ServerContext,
    step: &StepRecord,
    flow: &FlowRecord,
    run_id: i64,
) -> Result<StepDescriptor> {
    let tool = match step.tool_id {
        Some(id) => ctx.persistence.get_tool(id).await?,
        None => None,
    };
    let tool_name = match &tool {
        Some(t) => t.name.clone(),
        None => step
            .fields_raw
            .get("tool")
            .and_then(Value::as_str)
            .map(|r| parse_tool_ref(r).0.to_string())
            .unwrap_or_default(),
    };
    let mut fields = step.fields.as_object().cloned().unwrap_or_default();
    if tool_name == "git" {
        if let Some(checkout) = fields.get("checkout").and_then(Value::as_str) {
            let http_url = normalize_repo_url(checkout);
            fields.insert("http_url".to_string(), Value::from(http_url));
        }
    }
    if tool_name == "artifacts" {
        storage::enrich_artifacts_step(ctx, &mut fields, flow.branch_id, flow.id, run_id);
    }
    Ok(StepDescriptor {
        id: step.id,
        index: step.idx,
        tool: tool_name,
        tool_location: tool
            .as_ref()
            .map(|t| storage::tool_location_url(&ctx.settings.server_url, &t.location))
            .unwrap_or_default(),
        tool_entry: tool.as_ref().map(|t| t.entry.clone()).unwrap_or_default(),
        tool_id: step.tool_id,
        status: step_state(step.status),
        fields,
    })
}

async fn step_result(
    ctx: &ServerContext,
    agent: &AgentRecord,
    job_id: i64,
    step_idx: i32,
    result: StepResult,
    now: DateTime<Utc>,
) -> Result<AgentResponse> {
    if completed_elsewhere(ctx, agent, job_id).await? {
        return Ok(AgentResponse::cancel());
    }
    if agent.job_id != Some(job_id) {
        error!(agent_id = agent.id, job_id, reported_job = job_id, current_job = ?agent.job_id, "Agent reports a job it does not hold");
        return Ok(AgentResponse::default());
    }
    let job = ctx
        .persistence
        .get_job(job_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;

    let status = step_status(result.status);
    let data = Value::Object(result.data.clone());
    ctx.persistence.update_step(job_id, step_idx, status, &data).await?;
    ctx.persistence.mark_job_started(job_id, now).await?;
    debug!(job_id, step_idx, ?status, "Step result stored");

    let steps = ctx.persistence.list_job_steps(job_id).await?;
    let step = steps.iter().find(|s| s.idx == step_idx);
    let tool_id = step.and_then(|s| s.tool_id);
    store_test_results(ctx, job_id, tool_id, &result).await?;
    store_issues(ctx, job_id, &result).await?;
    let fields = step
        .and_then(|s| s.fields.as_object().cloned())
        .unwrap_or_default();
    storage::store_artifacts(ctx, job.run_id, &fields, &result).await?;
    if let Some(data) = result.data.get("data") {
        storage::handle_data(ctx, job.run_id, &fields, data).await?;
    }

    if jobs::steps_finished(&steps) {
        jobs::finish_job(ctx, job_id, agent.id).await?;
        return Ok(AgentResponse::default());
    }
    Ok(AgentResponse {
        timeout: Some(left_time(&job, now)),
        ..Default::default()
    })
}

async fn store_test_results(
    ctx: &ServerContext,
    job_id: i64,
    tool_id: Option<i64>,
    result: &StepResult,
) -> Result<()> {
    let entries = match result.test_results() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(job_id, error = %e, "Malformed test results ignored");
            return Ok(());
        }
    };
    if entries.is_empty() {
        return Ok(());
    }
    let results: Vec<NewTestResult> = entries
        .into_iter()
        .map(|e| NewTestResult {
            test_name: e.test,
            result: tc_result(e.status),
            cmd_line: e.cmd,
            values: e.values,
        })
        .collect();
    let stored = ctx.persistence.record_test_results(job_id, tool_id, &results).await?;
    debug!(job_id, stored, "Test results stored");
    Ok(())
}

async fn store_issues(ctx: &ServerContext, job_id: i64, result: &StepResult) -> Result<()> {
    let entries = match result.issues() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(job_id, error = %e, "Malformed issues ignored");
            return Ok(());
        }
    };
    if entries.is_empty() {
        return Ok(());
    }
    let issues: Vec<NewIssue> = entries
        .into_iter()
        .map(|e| NewIssue {
            issue_type: IssueType::from_name(&e.issue_type),
            line: e.line,
            col: e.column,
            path: e.path,
            symbol: e.symbol,
            message: e.message.chars().take(ISSUE_MESSAGE_LIMIT).collect(),
            extra: Value::Object(e.extra),
        })
        .collect();
    let stored = ctx.persistence.record_issues(job_id, &issues).await?;
    debug!(job_id, stored, "Issues stored");
    Ok(())
}

async fn dispatch_tests(
    ctx: &ServerContext,
    agent: &AgentRecord,
    job_id: i64,
    step_idx: i32,
    tests: &[String],
) -> Result<AgentResponse> {
    if completed_elsewhere(ctx, agent, job_id).await? {
        return Ok(AgentResponse::cancel());
    }
    if agent.job_id != Some(job_id) {
        error!(agent_id = agent.id, job_id, "Agent dispatches tests of a job it does not hold");
        return Ok(AgentResponse::default());
    }
    let kept = jobs::dispatch_tests(ctx, job_id, step_idx, tests).await?;
    Ok(AgentResponse {
        tests: Some(kept),
        ..Default::default()
    })
}

async fn sys_info(ctx: &ServerContext, agent: &AgentRecord, mut info: HostInfo) -> Result<AgentResponse> {
    info!(agent_id = agent.id, system = %info.system, distro = %info.distro_name, "Host info reported");

    // an agent installed with --system-id reports the numeric id
    let mut known = false;
    if let Ok(system_id) = info.system.parse::<i64>() {
        if let Some(system) = ctx.persistence.get_system(system_id).await? {
            info.system = system.name;
            known = true;
        }
    }
    ctx.persistence
        .update_agent_host_info(agent.id, &serde_json::to_value(&info)?)
        .await?;
    if !known && !info.system.is_empty() {
        ctx.persistence.ensure_system(&info.system, "local").await?;
    }
    ctx.wake_scheduler();
    Ok(AgentResponse {
        agent_id: Some(agent.id),
        ..Default::default()
    })
}

async fn keep_alive(ctx: &ServerContext, agent: &AgentRecord, job_id: Option<i64>) -> Result<AgentResponse> {
    let Some(job_id) = job_id.or(agent.job_id) else {
        return Ok(AgentResponse::default());
    };
    if completed_elsewhere(ctx, agent, job_id).await? {
        return Ok(AgentResponse::cancel());
    }
    Ok(AgentResponse::default())
}
