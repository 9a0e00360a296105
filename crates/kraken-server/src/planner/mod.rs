// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Planning of flows, runs and jobs.
//!
//! ```text
//! trigger ──▶ create_flow ──▶ start_run (per root stage)
//!                                │
//!                 schema in repo? ├──yes──▶ refresh_schema_repo ──┐
//!                                │                               ▼
//!                                └──no──────────────▶ complete_starting_run
//!                                                                │
//!                                            manual trigger? ────┤
//!                                                                ▼
//!                                                          trigger_jobs
//! ```
//!
//! Flows and runs get per-branch sequence numbers which are exposed to schema
//! code as arguments (`KK_FLOW_SEQ`, `KK_RUN_SEQ`, ...).

pub mod triggers;
mod webhook;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use kraken_core::model::{
    CompletionStatus, DEFAULT_JOB_TIMEOUT, FlowKind, JobState, MIN_JOB_TIMEOUT_SECS, RepoState,
    RunState, SecretKind, SeqKind,
};
use kraken_core::persistence::{
    BranchRecord, FlowRecord, JobRecord, NewFlow, NewJob, NewRun, NewStep, RunRecord,
    SecretRecord, StageRecord, StageRepoUpdate, timeout_key,
};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::broker::Task;
use crate::cloud::Deployment;
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::schema::eval::normalize;
use crate::schema::repo::{RepoSource, fetch_schema};
use crate::schema::subst::substitute_str;
use crate::schema::{
    SchemaContext, SchemaError, check_schema, evaluate, parse_tool_ref, substitute,
    validate_workflow,
};

pub use triggers::{PlannerConfig, PlannerLoop};
pub use webhook::{normalize_repo_url, trigger_flow};

/// Default step predicate.
const DEFAULT_WHEN: &str = "was_no_error";

/// What a new flow is made of.
#[derive(Debug, Clone, Default)]
pub struct FlowRequest {
    /// Arguments common to every stage.
    pub args: Map<String, Value>,
    /// Per-stage arguments keyed by stage name.
    pub stage_args: Map<String, Value>,
    /// Event that caused the flow (webhook payload, schedule).
    pub trigger_data: Option<Value>,
}

fn flow_seq_kind(kind: FlowKind) -> SeqKind {
    match kind {
        FlowKind::Ci => SeqKind::CiFlow,
        FlowKind::Dev => SeqKind::DevFlow,
    }
}

fn run_seq_kind(kind: FlowKind) -> SeqKind {
    match kind {
        FlowKind::Ci => SeqKind::CiRun,
        FlowKind::Dev => SeqKind::DevRun,
    }
}

fn object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn load_branch(ctx: &ServerContext, branch_id: i64) -> Result<BranchRecord> {
    ctx.persistence
        .get_branch(branch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("branch {}", branch_id)))
}

async fn load_stage(ctx: &ServerContext, stage_id: i64) -> Result<StageRecord> {
    ctx.persistence
        .get_stage(stage_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("stage {}", stage_id)))
}

async fn load_flow(ctx: &ServerContext, flow_id: i64) -> Result<FlowRecord> {
    ctx.persistence
        .get_flow(flow_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("flow {}", flow_id)))
}

async fn load_run(ctx: &ServerContext, run_id: i64) -> Result<RunRecord> {
    ctx.persistence
        .get_run(run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))
}

/// Whether a stage is started together with its flow.
fn is_root_stage(stage: &StageRecord) -> bool {
    let parent = stage.schema.get("parent").and_then(Value::as_str).unwrap_or("root");
    parent == "root" && parent_trigger_enabled(stage)
}

fn parent_trigger_enabled(stage: &StageRecord) -> bool {
    stage
        .schema
        .pointer("/triggers/parent")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

/// Create a flow without starting any stage.
pub async fn new_flow(
    ctx: &ServerContext,
    branch: &BranchRecord,
    kind: FlowKind,
    mut args: Map<String, Value>,
    trigger_data: Option<Value>,
) -> Result<FlowRecord> {
    let seqs = ctx
        .persistence
        .increment_sequences(branch.id, None, &[SeqKind::Flow, flow_seq_kind(kind)])
        .await?;
    let branch_name = match args.get("BRANCH").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ if !branch.branch_name.is_empty() => branch.branch_name.clone(),
        _ => "master".to_string(),
    };
    args.insert("KK_FLOW_SEQ".into(), Value::from(seqs[0].to_string()));
    args.insert("KK_CI_DEV_FLOW_SEQ".into(), Value::from(seqs[1].to_string()));
    args.insert("KK_FLOW_TYPE".into(), Value::from(kind.as_flow_type()));
    args.insert("KK_BRANCH".into(), Value::from(branch_name));

    let flow = ctx
        .persistence
        .create_flow(
            &NewFlow {
                branch_id: branch.id,
                kind,
                args: Value::Object(args),
                trigger_data,
            },
            Utc::now(),
        )
        .await?;
    info!(flow_id = flow.id, branch_id = branch.id, kind = kind.as_flow_type(), "Flow created");
    Ok(flow)
}

/// Create a flow and start its root stages.
pub async fn create_flow(
    ctx: &ServerContext,
    branch_id: i64,
    kind: FlowKind,
    request: FlowRequest,
) -> Result<FlowRecord> {
    let branch = load_branch(ctx, branch_id).await?;
    let flow = new_flow(ctx, &branch, kind, request.args, request.trigger_data).await?;

    for stage in ctx.persistence.list_branch_stages(branch.id).await? {
        if !stage.enabled || !is_root_stage(&stage) {
            continue;
        }
        let args = request.stage_args.get(&stage.name).cloned().unwrap_or_else(|| json!({}));
        if let Err(e) = start_run(ctx, &stage, &flow, json!({"reason": "manual"}), args).await {
            error!(flow_id = flow.id, stage_id = stage.id, error = %e, "Failed to start run");
        }
    }
    Ok(flow)
}

/// Start (or replay) the run of `stage` in `flow`.
pub async fn start_run(
    ctx: &ServerContext,
    stage: &StageRecord,
    flow: &FlowRecord,
    reason: Value,
    args: Value,
) -> Result<RunRecord> {
    if let Some(run) = ctx.persistence.find_run(flow.id, stage.id).await? {
        info!(run_id = run.id, stage_id = stage.id, "Replaying run");
        ctx.persistence.reopen_run(run.id).await?;
        let run = load_run(ctx, run.id).await?;
        trigger_jobs(ctx, &run, true).await?;
        return Ok(run);
    }

    let run = ctx
        .persistence
        .create_run(
            &NewRun {
                flow_id: flow.id,
                stage_id: stage.id,
                args,
                reason,
                repo_data: flow.trigger_data.clone(),
            },
            Utc::now(),
        )
        .await?;
    info!(run_id = run.id, flow_id = flow.id, stage = %stage.name, "Run created");

    if stage.schema_from_repo_enabled {
        ctx.broker
            .enqueue(Task::RefreshSchemaRepo {
                stage_id: stage.id,
                run_id: Some(run.id),
            })
            .await?;
        return Ok(run);
    }
    complete_starting_run(ctx, run.id).await?;
    load_run(ctx, run.id).await
}

/// Parameter defaults declared by the stage schema.
fn parameter_defaults(schema: &Value) -> Map<String, Value> {
    schema
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|p| {
            let name = p.get("name")?.as_str()?;
            Some((name.to_string(), p.get("default").cloned().unwrap_or(Value::Null)))
        })
        .filter(|(_, v)| !v.is_null())
        .collect()
}

/// Merge arguments, assign run sequences and labels, then trigger jobs unless
/// the stage requires a manual start.
pub async fn complete_starting_run(ctx: &ServerContext, run_id: i64) -> Result<()> {
    let run = load_run(ctx, run_id).await?;
    let flow = load_flow(ctx, run.flow_id).await?;
    let stage = load_stage(ctx, run.stage_id).await?;
    let branch = load_branch(ctx, flow.branch_id).await?;

    let mut args = parameter_defaults(&stage.schema);
    args.extend(object(&flow.args));
    args.extend(object(&run.args));

    let seqs = ctx
        .persistence
        .increment_sequences(
            branch.id,
            Some(stage.id),
            &[SeqKind::Run, run_seq_kind(flow.kind)],
        )
        .await?;
    args.insert("KK_RUN_SEQ".into(), Value::from(seqs[0].to_string()));
    args.insert("KK_CI_DEV_RUN_SEQ".into(), Value::from(seqs[1].to_string()));
    let args = Value::Object(args);

    let vars = SchemaContext::new(&branch.branch_name)
        .with_branch(&branch)
        .with_stage(&stage)
        .with_flow(&flow)
        .with_run(&run)
        .with_args(&args)
        .substitution_vars(&Map::new());

    if flow.label.is_none() {
        if let Some(pattern) = stage.schema.get("flow_label").and_then(Value::as_str) {
            let label = substitute_str(pattern, &vars);
            ctx.persistence.update_flow_args(flow.id, &flow.args, Some(&label)).await?;
        }
    }
    let run_label = stage
        .schema
        .get("run_label")
        .and_then(Value::as_str)
        .map(|pattern| substitute_str(pattern, &vars));

    let manual_stage = stage
        .schema
        .pointer("/triggers/manual")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let started_by_hand = run.reason.get("reason").and_then(Value::as_str) == Some("manual")
        && run.reason.get("user").is_some();
    if manual_stage && !started_by_hand {
        ctx.persistence
            .update_run_start(run.id, &args, run_label.as_deref(), RunState::Manual, None)
            .await?;
        info!(run_id = run.id, "Run waits for a manual start");
        return Ok(());
    }

    ctx.persistence
        .update_run_start(
            run.id,
            &args,
            run_label.as_deref(),
            RunState::InProgress,
            Some(Utc::now()),
        )
        .await?;
    let run = load_run(ctx, run.id).await?;
    trigger_jobs(ctx, &run, false).await
}

/// Start a run that waits in `Manual` state.
pub async fn start_manual_run(ctx: &ServerContext, run_id: i64, user: &str) -> Result<()> {
    let run = load_run(ctx, run_id).await?;
    if run.state != RunState::Manual {
        return Err(Error::InvalidRequest(format!(
            "run {} is not waiting for a manual start",
            run_id
        )));
    }
    ctx.persistence
        .update_run_start(
            run.id,
            &run.args,
            run.label.as_deref(),
            RunState::InProgress,
            Some(Utc::now()),
        )
        .await?;
    info!(run_id, user, "Run started manually");
    let run = load_run(ctx, run.id).await?;
    trigger_jobs(ctx, &run, false).await
}

/// Substitution variables of project secrets and the names to mask.
pub fn secret_vars(secrets: &[SecretRecord]) -> (Map<String, Value>, HashSet<String>) {
    let mut vars = Map::new();
    let mut names = HashSet::new();
    for secret in secrets.iter().filter(|s| s.deleted.is_none()) {
        let text = |key: &str| {
            secret
                .data
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match secret.kind {
            SecretKind::Simple => {
                let name = format!("KK_SECRET_SIMPLE_{}", secret.name);
                vars.insert(name.clone(), Value::from(text("secret")));
                names.insert(name);
            }
            SecretKind::SshKey => {
                let user = format!("KK_SECRET_USER_{}", secret.name);
                let key = format!("KK_SECRET_KEY_{}", secret.name);
                vars.insert(user, Value::from(text("username")));
                vars.insert(key.clone(), Value::from(text("key")));
                names.insert(key);
            }
        }
    }
    (vars, names)
}

/// Raw, substituted and masked fields of one step.
///
/// The `tool` key is dropped from the substituted trees; a missing `when`
/// defaults to `was_no_error`.
pub fn evaluate_step_fields(
    step: &Value,
    vars: &Value,
    secret_names: &HashSet<String>,
) -> (Value, Value, Value) {
    let mut raw = step.clone();
    if let Some(obj) = raw.as_object_mut() {
        obj.entry("when").or_insert_with(|| Value::from(DEFAULT_WHEN));
    }
    let out = substitute(&raw, vars, secret_names);
    let (mut fields, mut masked) = (out.fields, out.masked);
    for tree in [&mut fields, &mut masked] {
        if let Some(obj) = tree.as_object_mut() {
            obj.remove("tool");
        }
    }
    (raw, fields, masked)
}

/// Evaluate the stage schema for a run. Stages without code use their
/// stored tree.
fn stage_tree(stage: &StageRecord, sctx: &SchemaContext) -> Result<Value> {
    let tree = if stage.schema_code.trim().is_empty() {
        normalize(stage.schema.clone())
    } else {
        evaluate(&stage.schema_code, sctx)?
    };
    validate_workflow(&tree)?;
    Ok(tree)
}

/// Create the jobs of a run from its stage schema.
///
/// Any failure completes the run with a note instead of propagating.
pub async fn trigger_jobs(ctx: &ServerContext, run: &RunRecord, replay: bool) -> Result<()> {
    match plan_jobs(ctx, run, replay).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(run_id = run.id, error = %e, "Triggering run's jobs failed");
            let note = format!("Triggering run's jobs failed: {}", e);
            complete_run(ctx, run.id, Some(&note)).await
        }
    }
}

struct PlannedJob {
    job: NewJob,
    key: (String, i64, i64),
}

async fn plan_jobs(ctx: &ServerContext, run: &RunRecord, replay: bool) -> Result<()> {
    let flow = load_flow(ctx, run.flow_id).await?;
    let stage = load_stage(ctx, run.stage_id).await?;
    let branch = load_branch(ctx, flow.branch_id).await?;
    let project = ctx
        .persistence
        .get_project(branch.project_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", branch.project_id)))?;

    let sctx = SchemaContext::new(&branch.branch_name)
        .with_project(&project)
        .with_branch(&branch)
        .with_stage(&stage)
        .with_flow(&flow)
        .with_run(run)
        .with_args(&run.args);
    let tree = stage_tree(&stage, &sctx)?;

    let secrets = ctx.persistence.list_project_secrets(project.id).await?;
    let (extra, secret_names) = secret_vars(&secrets);
    let vars = sctx.substitution_vars(&extra);
    let timeouts = object(&stage.timeouts);

    let mut planned: Vec<PlannedJob> = Vec::new();
    let mut agents_needed: HashSet<i64> = HashSet::new();
    let jobs = tree.get("jobs").and_then(Value::as_array).cloned().unwrap_or_default();
    for job in &jobs {
        let name = job.get("name").and_then(Value::as_str).unwrap_or_default();
        let declared_timeout = job.get("timeout").and_then(Value::as_i64);
        let steps = job.get("steps").and_then(Value::as_array).cloned().unwrap_or_default();
        let envs = job.get("environments").and_then(Value::as_array).cloned().unwrap_or_default();

        for env in &envs {
            let group_name = env.get("agents_group").and_then(Value::as_str).unwrap_or_default();
            let executor = env.get("executor").and_then(Value::as_str).unwrap_or("local");
            let systems: Vec<String> = match env.get("system") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Some(Value::String(s)) => vec![s.clone()],
                _ => Vec::new(),
            };

            let group = ctx
                .persistence
                .find_agents_group(group_name, Some(project.id))
                .await?;
            let failure: Option<(CompletionStatus, String)> = match &group {
                None => Some((
                    CompletionStatus::MissingAgentsGroup,
                    format!("cannot find agents group '{}' in database", group_name),
                )),
                Some(g) if Deployment::of_group(g).is_some() => {
                    agents_needed.insert(g.id);
                    None
                }
                Some(g) => {
                    let agents = ctx.persistence.list_group_agents(g.id).await?;
                    if agents.iter().any(|a| a.authorized && !a.disabled) {
                        None
                    } else {
                        Some((
                            CompletionStatus::NoAgents,
                            format!(
                                "there are no agents in group '{}' - add some agents",
                                group_name
                            ),
                        ))
                    }
                }
            };

            for system_name in &systems {
                let system = ctx.persistence.ensure_system(system_name, executor).await?;
                let group_id = group.as_ref().map(|g| g.id);

                let timeout = timeouts
                    .get(&timeout_key(name, system.id, group_id.unwrap_or(0)))
                    .and_then(Value::as_i64)
                    .unwrap_or_else(|| {
                        declared_timeout
                            .unwrap_or(DEFAULT_JOB_TIMEOUT.as_secs() as i64)
                            .max(MIN_JOB_TIMEOUT_SECS as i64)
                    });

                let mut job_failure = failure.clone();
                let mut new_steps = Vec::with_capacity(steps.len());
                for step in &steps {
                    let tool_ref = step.get("tool").and_then(Value::as_str).unwrap_or_default();
                    let (tool_name, version) = parse_tool_ref(tool_ref);
                    let tool = ctx.persistence.find_tool(tool_name, version).await?;
                    if tool.is_none() && job_failure.is_none() {
                        job_failure = Some((
                            CompletionStatus::MissingToolInDb,
                            format!("cannot find tool '{}' in database", tool_ref),
                        ));
                    }
                    let (fields_raw, fields, fields_masked) =
                        evaluate_step_fields(step, &vars, &secret_names);
                    new_steps.push(NewStep {
                        tool_id: tool.map(|t| t.id),
                        fields_raw,
                        fields,
                        fields_masked,
                    });
                }

                let (state, completion_status, notes) = match job_failure {
                    Some((status, note)) => (JobState::Completed, Some(status), Some(note)),
                    None => (JobState::Prequeued, None, None),
                };
                planned.push(PlannedJob {
                    key: (name.to_string(), system.id, group_id.unwrap_or(0)),
                    job: NewJob {
                        run_id: run.id,
                        name: name.to_string(),
                        agents_group_id: group_id,
                        system_id: Some(system.id),
                        timeout: i32::try_from(timeout).unwrap_or(i32::MAX),
                        state,
                        completion_status,
                        notes,
                        steps: new_steps,
                    },
                });
            }
        }
    }

    let previous: HashMap<(String, i64, i64), JobRecord> = if replay {
        ctx.persistence
            .list_run_jobs(run.id)
            .await?
            .into_iter()
            .filter(|j| !j.covered)
            .map(|j| {
                (
                    (
                        j.name.clone(),
                        j.system_id.unwrap_or(0),
                        j.agents_group_id.unwrap_or(0),
                    ),
                    j,
                )
            })
            .collect()
    } else {
        HashMap::new()
    };

    let now = Utc::now();
    let mut created = 0usize;
    let mut erred = 0usize;
    let mut covered = Vec::new();
    for plan in &planned {
        if let Some(old) = previous.get(&plan.key) {
            covered.push(old.id);
        }
        let job = ctx.persistence.create_job(&plan.job, now).await?;
        created += 1;
        if job.state == JobState::Completed {
            erred += 1;
            warn!(job_id = job.id, run_id = run.id, notes = ?job.notes, "Job failed at creation");
        }
    }
    if !covered.is_empty() {
        ctx.persistence.cover_jobs(&covered).await?;
    }
    let queued = ctx.persistence.queue_run_jobs(run.id).await?;
    if queued > 0 {
        ctx.wake_scheduler();
    }
    info!(run_id = run.id, jobs = created, queued, replay, "Run jobs triggered");

    for group_id in agents_needed {
        ctx.broker.enqueue(Task::SpawnNewAgents { agents_group_id: group_id }).await?;
    }
    ctx.broker.enqueue(Task::NotifyAboutStartedRun { run_id: run.id }).await?;

    if created == 0 || erred == created {
        complete_run(ctx, run.id, None).await?;
    }
    Ok(())
}

/// Complete a run and schedule its analysis. Completing twice is a no-op.
pub async fn complete_run(ctx: &ServerContext, run_id: i64, note: Option<&str>) -> Result<()> {
    if ctx.persistence.complete_run(run_id, note, Utc::now()).await? {
        info!(run_id, "Run completed");
        ctx.broker.enqueue(Task::AnalyzeRun { run_id }).await?;
    }
    Ok(())
}

/// Start the stages that follow a completed run within its flow.
///
/// Returns the number of runs started.
pub async fn trigger_following_stages(ctx: &ServerContext, run: &RunRecord) -> Result<usize> {
    if run.jobs_error > 0 {
        debug!(run_id = run.id, "Run has job errors, following stages not started");
        return Ok(0);
    }
    let flow = load_flow(ctx, run.flow_id).await?;
    let parent = load_stage(ctx, run.stage_id).await?;
    let mut started = 0;
    for stage in ctx.persistence.list_branch_stages(flow.branch_id).await? {
        if !stage.enabled || stage.id == parent.id {
            continue;
        }
        if stage.schema.get("parent").and_then(Value::as_str) != Some(parent.name.as_str()) {
            continue;
        }
        let manual = stage
            .schema
            .pointer("/triggers/manual")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !parent_trigger_enabled(&stage) && !manual {
            continue;
        }
        if ctx.persistence.find_run(flow.id, stage.id).await?.is_some() {
            continue;
        }
        let reason = json!({"reason": "parent", "run_id": run.id});
        start_run(ctx, &stage, &flow, reason, json!({})).await?;
        started += 1;
    }
    Ok(started)
}

/// Start one stage in a fresh flow (periodic triggers).
pub async fn trigger_run(
    ctx: &ServerContext,
    stage_id: i64,
    kind: FlowKind,
    reason: Value,
) -> Result<RunRecord> {
    let stage = load_stage(ctx, stage_id).await?;
    let branch = load_branch(ctx, stage.branch_id).await?;
    let flow = new_flow(ctx, &branch, kind, Map::new(), Some(reason.clone())).await?;
    start_run(ctx, &stage, &flow, reason, json!({})).await
}

/// Evaluate and fully check a stage's schema code (stage edit path).
pub async fn check_stage_schema(
    ctx: &ServerContext,
    stage: &StageRecord,
    code: &str,
) -> Result<Value> {
    let branch = load_branch(ctx, stage.branch_id).await?;
    let sctx = SchemaContext::new(&branch.branch_name)
        .with_branch(&branch)
        .with_stage(stage);
    let tree = evaluate(code, &sctx)?;
    check_schema(ctx.persistence.as_ref(), &tree).await?;
    Ok(tree)
}

/// Re-read a stage's schema from its repository, then finish starting the
/// runs that waited for it.
///
/// A failure is recorded on the stage and keeps the previous schema.
pub async fn refresh_schema_repo(ctx: &ServerContext, stage_id: i64) -> Result<()> {
    let stage = load_stage(ctx, stage_id).await?;
    let update = match fetch_and_check(ctx, &stage).await {
        Ok((code, tree, version)) => {
            info!(stage_id, version = %version, "Stage schema refreshed from repository");
            StageRepoUpdate {
                schema_code: Some(code),
                schema: Some(tree),
                repo_state: RepoState::Ok,
                repo_error: None,
                repo_version: Some(version),
            }
        }
        Err(e) => {
            warn!(stage_id, error = %e, "Stage schema refresh failed");
            StageRepoUpdate {
                schema_code: None,
                schema: None,
                repo_state: RepoState::Error,
                repo_error: Some(e.to_string()),
                repo_version: None,
            }
        }
    };
    ctx.persistence.update_stage_repo(stage_id, &update).await?;

    for run in ctx.persistence.list_runs_in_progress().await? {
        if run.stage_id == stage_id && run.started.is_none() {
            if let Err(e) = complete_starting_run(ctx, run.id).await {
                error!(run_id = run.id, error = %e, "Failed to start run after schema refresh");
            }
        }
    }
    Ok(())
}

async fn fetch_and_check(
    ctx: &ServerContext,
    stage: &StageRecord,
) -> Result<(String, Value, String)> {
    let (Some(url), Some(schema_file)) = (stage.repo_url.as_deref(), stage.schema_file.as_deref())
    else {
        return Err(SchemaError::Repo("repository URL or schema file not set".into()).into());
    };
    let source = RepoSource {
        url,
        branch: stage.repo_branch.as_deref().unwrap_or("master"),
        access_token: stage.repo_access_token.as_deref(),
        schema_file,
    };
    let fetched = fetch_schema(&ctx.objstore, stage.branch_id, &source).await?;
    let tree = check_stage_schema(ctx, stage, &fetched.code).await?;
    Ok((fetched.code, tree, fetched.version))
}

#[cfg(test)]
mod tests;
