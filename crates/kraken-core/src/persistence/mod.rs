// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for kraken-core.
//!
//! The [`Persistence`] trait is the single gateway to relational state. Every
//! method that mutates job, agent or run state is one transaction in the
//! PostgreSQL backend; callers never compose multi-statement updates
//! themselves. The in-memory backend holds one lock per call, which gives the
//! same atomicity for tests.
//!
//! Ordering contracts that callers rely on:
//! - [`Persistence::list_waiting_jobs`] is FIFO by `(run.created, job.created)`.
//! - [`Persistence::result_history`] is ascending by flow creation time.
//! - [`Persistence::claim_tasks`] returns oldest `run_at` first.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{
    ArtifactSection, CommentState, CompletionStatus, FlowKind, FlowState, IssueType, JobState,
    RepoState, ResultChange, RunState, SecretKind, SeqKind, StepStatus, TaskState, TcResult,
    UserDataScope,
};

// ============================================================================
// Record Types
// ============================================================================

/// A project groups branches, secrets and webhook settings.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Webhook settings, e.g. `{"github_enabled": true, "github_secret": "..."}`.
    pub webhooks: Value,
    pub user_data: Value,
    pub created: DateTime<Utc>,
}

/// A branch of a project; owns stages and flows.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BranchRecord {
    pub id: i64,
    pub project_id: i64,
    /// Display name.
    pub name: String,
    /// Upstream VCS branch name.
    pub branch_name: String,
    pub user_data: Value,
    pub user_data_ci: Value,
    pub user_data_dev: Value,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

/// A node of the workflow graph within a branch.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StageRecord {
    pub id: i64,
    pub branch_id: i64,
    pub name: String,
    pub enabled: bool,
    /// Workflow definition source.
    pub schema_code: String,
    /// Last successfully evaluated schema tree.
    pub schema: Value,
    pub schema_from_repo_enabled: bool,
    pub repo_url: Option<String>,
    pub repo_branch: Option<String>,
    pub repo_access_token: Option<String>,
    pub schema_file: Option<String>,
    pub repo_state: Option<RepoState>,
    pub repo_error: Option<String>,
    pub repo_version: Option<String>,
    /// Learned timeouts keyed by `name-sysid-grpid`.
    pub timeouts: Value,
    /// Planner state for periodic triggers (next fire times).
    pub triggers: Value,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

/// One execution of a branch's pipeline.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FlowRecord {
    pub id: i64,
    pub branch_id: i64,
    pub kind: FlowKind,
    pub state: FlowState,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub args: Value,
    pub trigger_data: Option<Value>,
    pub label: Option<String>,
    pub user_data: Value,
}

/// One execution of a stage within a flow.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub flow_id: i64,
    pub stage_id: i64,
    pub state: RunState,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub args: Value,
    pub label: Option<String>,
    pub reason: Value,
    pub note: Option<String>,
    pub repo_data: Option<Value>,
    pub tests_total: i32,
    pub tests_passed: i32,
    pub tests_not_run: i32,
    pub jobs_total: i32,
    pub jobs_error: i32,
    pub issues_total: i32,
    pub issues_new: i32,
    pub new_cnt: i32,
    pub no_change_cnt: i32,
    pub regr_cnt: i32,
    pub fix_cnt: i32,
}

/// Scheduler-assignable unit of work.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    pub state: JobState,
    pub completion_status: Option<CompletionStatus>,
    /// Superseded by a rerun clone or a replay.
    pub covered: bool,
    pub agents_group_id: Option<i64>,
    pub system_id: Option<i64>,
    pub agent_used_id: Option<i64>,
    /// Seconds.
    pub timeout: i32,
    pub created: DateTime<Utc>,
    pub assigned: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl JobRecord {
    /// Key used in the stage's learned timeouts table.
    pub fn timeout_key(&self) -> String {
        timeout_key(
            &self.name,
            self.system_id.unwrap_or(0),
            self.agents_group_id.unwrap_or(0),
        )
    }
}

/// Key of the learned timeouts table: `name-sysid-grpid`.
pub fn timeout_key(name: &str, system_id: i64, agents_group_id: i64) -> String {
    format!("{}-{}-{}", name, system_id, agents_group_id)
}

/// An ordered phase of a job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    pub id: i64,
    pub job_id: i64,
    /// 0-based, gapless within the job.
    pub idx: i32,
    pub tool_id: Option<i64>,
    /// Fields as written in the schema, before substitution.
    pub fields_raw: Value,
    /// Substituted fields handed to the agent.
    pub fields: Value,
    /// Substituted fields with secrets masked.
    pub fields_masked: Value,
    pub status: StepStatus,
    pub result: Value,
}

/// A versioned step program.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolRecord {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub description: String,
    /// JSON Schema of the step fields the tool accepts.
    pub fields_schema: Value,
    /// `builtin`, a local path, a git URL or an object-store blob reference.
    pub location: String,
    /// Entry point identifier passed to `kktool -m`.
    pub entry: String,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

/// Runtime environment identity: image name plus executor.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SystemRecord {
    pub id: i64,
    pub name: String,
    pub executor: String,
}

/// A worker machine or container.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub ip_address: Option<String>,
    pub authorized: bool,
    pub disabled: bool,
    pub deleted: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub host_info: Value,
    /// Cloud bookkeeping: `instance_id`, `task_arn`, `pod`, `system`, ...
    pub extra_attrs: Value,
    pub job_id: Option<i64>,
    pub status_line: Option<String>,
}

impl AgentRecord {
    /// System declared in host info, if any.
    pub fn declared_system(&self) -> Option<&str> {
        self.host_info
            .get("system")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Whether the scheduler may hand this agent a job.
    pub fn is_idle(&self) -> bool {
        self.job_id.is_none() && self.authorized && !self.disabled && self.deleted.is_none()
    }
}

/// A set of agents eligible for the same jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentsGroupRecord {
    pub id: i64,
    pub name: String,
    pub project_id: Option<i64>,
    /// `{"method": "aws-ec2", "aws": {...}}` or null for static groups.
    pub deployment: Option<Value>,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

/// Logical identity of a test across history.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TestCaseRecord {
    pub id: i64,
    pub tool_id: Option<i64>,
    pub name: String,
}

/// Outcome of a test case within one job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TestCaseResultRecord {
    pub id: i64,
    pub test_case_id: i64,
    pub job_id: i64,
    pub result: TcResult,
    pub instability: i32,
    pub age: i32,
    pub change: ResultChange,
    pub relevancy: i32,
    pub cmd_line: Option<String>,
    pub comment_id: Option<i64>,
    pub values: Option<Value>,
}

/// Triage note bound to a test case on a branch.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TestCaseCommentRecord {
    pub id: i64,
    pub test_case_id: i64,
    pub branch_id: i64,
    pub state: CommentState,
    pub data: Value,
    pub created: DateTime<Utc>,
}

/// Static-analysis finding of a job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IssueRecord {
    pub id: i64,
    pub job_id: i64,
    pub issue_type: IssueType,
    pub line: i32,
    pub col: i32,
    pub path: String,
    pub symbol: String,
    pub message: String,
    pub age: i32,
    pub extra: Value,
}

/// Artifact stored by a run. Rows without a path carry only a report entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArtifactRecord {
    pub id: i64,
    pub flow_id: i64,
    pub run_id: i64,
    pub section: ArtifactSection,
    pub path: Option<String>,
    pub size: i64,
    pub report_entry: Option<String>,
    pub created: DateTime<Utc>,
}

/// Project secret. `data` holds `{"secret": ...}` or `{"username", "key"}`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretRecord {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub kind: SecretKind,
    pub data: Value,
    pub deleted: Option<DateTime<Utc>>,
}

/// Background task row of the work broker.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRecord {
    pub id: i64,
    pub kind: String,
    pub payload: Value,
    pub coalesce_key: Option<String>,
    pub state: TaskState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub last_error: Option<String>,
}

// ============================================================================
// Inputs
// ============================================================================

/// Input for [`Persistence::create_project`].
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub webhooks: Value,
    pub user_data: Value,
}

/// Input for [`Persistence::create_branch`].
#[derive(Debug, Clone, Default)]
pub struct NewBranch {
    pub project_id: i64,
    pub name: String,
    pub branch_name: String,
}

/// Input for [`Persistence::create_stage`].
#[derive(Debug, Clone, Default)]
pub struct NewStage {
    pub branch_id: i64,
    pub name: String,
    pub enabled: bool,
    pub schema_code: String,
    pub schema: Value,
    pub schema_from_repo_enabled: bool,
    pub repo_url: Option<String>,
    pub repo_branch: Option<String>,
    pub repo_access_token: Option<String>,
    pub schema_file: Option<String>,
}

/// Input for [`Persistence::create_tool`].
#[derive(Debug, Clone, Default)]
pub struct NewTool {
    pub name: String,
    pub version: String,
    pub description: String,
    pub fields_schema: Value,
    pub location: String,
    pub entry: String,
}

/// Input for [`Persistence::create_agents_group`].
#[derive(Debug, Clone, Default)]
pub struct NewAgentsGroup {
    pub name: String,
    pub project_id: Option<i64>,
    pub deployment: Option<Value>,
}

/// Input for [`Persistence::create_secret`].
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub project_id: i64,
    pub name: String,
    pub kind: SecretKind,
    pub data: Value,
}

/// Input for [`Persistence::create_flow`].
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub branch_id: i64,
    pub kind: FlowKind,
    pub args: Value,
    pub trigger_data: Option<Value>,
}

/// Input for [`Persistence::create_run`].
#[derive(Debug, Clone)]
pub struct NewRun {
    pub flow_id: i64,
    pub stage_id: i64,
    pub args: Value,
    pub reason: Value,
    pub repo_data: Option<Value>,
}

/// Input for one step of [`NewJob`].
#[derive(Debug, Clone)]
pub struct NewStep {
    pub tool_id: Option<i64>,
    pub fields_raw: Value,
    pub fields: Value,
    pub fields_masked: Value,
}

/// Input for [`Persistence::create_job`]. Steps get indexes `0..n` in order.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub run_id: i64,
    pub name: String,
    pub agents_group_id: Option<i64>,
    pub system_id: Option<i64>,
    pub timeout: i32,
    pub state: JobState,
    /// Set for jobs that are terminal at creation (configuration errors).
    pub completion_status: Option<CompletionStatus>,
    pub notes: Option<String>,
    pub steps: Vec<NewStep>,
}

/// Input for [`Persistence::create_agent`].
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    pub name: String,
    pub address: String,
    pub ip_address: Option<String>,
    pub extra_attrs: Value,
    pub authorized: bool,
    pub disabled: bool,
    pub agents_group_id: Option<i64>,
}

/// One test result reported by a tool.
#[derive(Debug, Clone)]
pub struct NewTestResult {
    pub test_name: String,
    pub result: TcResult,
    pub cmd_line: Option<String>,
    pub values: Option<Value>,
}

/// One issue reported by a tool.
#[derive(Debug, Clone)]
pub struct NewIssue {
    pub issue_type: IssueType,
    pub line: i32,
    pub col: i32,
    pub path: String,
    pub symbol: String,
    pub message: String,
    pub extra: Value,
}

/// One artifact reported by a tool, or a bare report entry.
#[derive(Debug, Clone, Default)]
pub struct NewArtifact {
    pub path: Option<String>,
    pub size: i64,
    pub report_entry: Option<String>,
}

/// Input for [`Persistence::enqueue_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: String,
    pub payload: Value,
    /// When set the task goes through the coalescer (see [`crate::queue`]).
    pub coalesce_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
}

/// Outcome of a schema-from-repo refresh.
#[derive(Debug, Clone)]
pub struct StageRepoUpdate {
    /// New code and tree; `None` keeps the previous good schema.
    pub schema_code: Option<String>,
    pub schema: Option<Value>,
    pub repo_state: RepoState,
    pub repo_error: Option<String>,
    pub repo_version: Option<String>,
}

/// Run summary counters computed by run analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub tests_total: i32,
    pub tests_passed: i32,
    pub tests_not_run: i32,
    pub jobs_total: i32,
    pub jobs_error: i32,
    pub issues_total: i32,
}

/// Run counters computed by results-history analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryCounters {
    pub new_cnt: i32,
    pub no_change_cnt: i32,
    pub regr_cnt: i32,
    pub fix_cnt: i32,
    pub issues_new: i32,
}

// ============================================================================
// Query helpers
// ============================================================================

/// A queued job as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingJob {
    pub job_id: i64,
    pub run_id: i64,
    pub agents_group_id: i64,
    pub system_name: String,
    pub executor: String,
}

/// An idle agent with its group memberships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleAgent {
    pub agent_id: i64,
    /// System declared in host info; `None` until the first `sys-info`.
    pub system: Option<String>,
    pub group_ids: Vec<i64>,
}

/// History lookup for one test case.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub test_case_id: i64,
    pub branch_id: i64,
    pub agents_group_id: Option<i64>,
    pub system_id: Option<i64>,
    /// Only flows created at or before this instant.
    pub flow_created_before: DateTime<Utc>,
    /// The result being analyzed; never part of its own history.
    pub exclude_result_id: i64,
    pub limit: i64,
}

/// Lookup of the previous comparable job for issue history.
#[derive(Debug, Clone)]
pub struct PriorJobQuery {
    pub name: String,
    pub stage_id: i64,
    pub agents_group_id: Option<i64>,
    pub system_id: Option<i64>,
    pub flow_created_before: DateTime<Utc>,
}

/// Lookup of recent durations for timeout estimation.
#[derive(Debug, Clone)]
pub struct DurationQuery {
    pub stage_id: i64,
    pub name: String,
    pub agents_group_id: Option<i64>,
    pub system_id: Option<i64>,
    pub limit: i64,
}

/// Size and number of files in one artifact section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactTotals {
    pub size: i64,
    pub count: i64,
}

/// Artifacts of a run or a flow as shown on its summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactsSummary {
    pub public: ArtifactTotals,
    pub private: ArtifactTotals,
    /// Report entries of public artifacts, in upload order.
    pub entries: Vec<String>,
}

impl ArtifactsSummary {
    pub fn from_records(records: &[ArtifactRecord]) -> Self {
        let mut summary = Self::default();
        for rec in records {
            let totals = match rec.section {
                ArtifactSection::Public => &mut summary.public,
                ArtifactSection::Private => &mut summary.private,
            };
            if rec.path.is_some() {
                totals.size += rec.size;
                totals.count += 1;
            }
            if rec.section == ArtifactSection::Public
                && let Some(entry) = &rec.report_entry
            {
                summary.entries.push(entry.clone());
            }
        }
        summary
    }
}

/// Completed-job statistics of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentJobStats {
    pub completed_jobs: i64,
    pub last_finished: Option<DateTime<Utc>>,
}

// ============================================================================
// Persistence trait
// ============================================================================

/// Persistence facade over the relational store.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Create a project.
    async fn create_project(&self, project: &NewProject) -> Result<ProjectRecord, CoreError>;

    /// Create a branch.
    async fn create_branch(&self, branch: &NewBranch) -> Result<BranchRecord, CoreError>;

    /// Create a stage.
    async fn create_stage(&self, stage: &NewStage) -> Result<StageRecord, CoreError>;

    /// Register a tool version.
    async fn create_tool(&self, tool: &NewTool) -> Result<ToolRecord, CoreError>;

    /// Create an agents group.
    async fn create_agents_group(
        &self,
        group: &NewAgentsGroup,
    ) -> Result<AgentsGroupRecord, CoreError>;

    /// Link an agent to a group; linking twice is a no-op.
    async fn assign_agent_to_group(&self, agent_id: i64, group_id: i64) -> Result<(), CoreError>;

    /// Store a project secret.
    async fn create_secret(&self, secret: &NewSecret) -> Result<SecretRecord, CoreError>;

    /// Add a triage comment; duplicates per (test case, branch) are allowed.
    async fn create_test_case_comment(
        &self,
        test_case_id: i64,
        branch_id: i64,
        state: CommentState,
        data: &Value,
        now: DateTime<Utc>,
    ) -> Result<TestCaseCommentRecord, CoreError>;

    // ------------------------------------------------------------------
    // Projects, branches, stages
    // ------------------------------------------------------------------

    /// Get a project by id.
    async fn get_project(&self, id: i64) -> Result<Option<ProjectRecord>, CoreError>;

    /// Get a branch by id.
    async fn get_branch(&self, id: i64) -> Result<Option<BranchRecord>, CoreError>;

    /// Non-deleted branches of a project.
    async fn list_project_branches(&self, project_id: i64)
    -> Result<Vec<BranchRecord>, CoreError>;

    /// Get a stage by id.
    async fn get_stage(&self, id: i64) -> Result<Option<StageRecord>, CoreError>;

    /// Non-deleted stages of a branch, ordered by id.
    async fn list_branch_stages(&self, branch_id: i64) -> Result<Vec<StageRecord>, CoreError>;

    /// Every enabled, non-deleted stage (planner input).
    async fn list_enabled_stages(&self) -> Result<Vec<StageRecord>, CoreError>;

    /// Record the outcome of a schema refresh.
    async fn update_stage_repo(
        &self,
        stage_id: i64,
        update: &StageRepoUpdate,
    ) -> Result<(), CoreError>;

    /// Replace the learned timeouts table.
    async fn update_stage_timeouts(&self, stage_id: i64, timeouts: &Value)
    -> Result<(), CoreError>;

    /// Replace the planner trigger state.
    async fn update_stage_triggers(&self, stage_id: i64, triggers: &Value)
    -> Result<(), CoreError>;

    /// Non-deleted secrets of a project.
    async fn list_project_secrets(&self, project_id: i64)
    -> Result<Vec<SecretRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Sequences
    // ------------------------------------------------------------------

    /// Atomically increment the given counters and return their new values in
    /// the same order. Stage-scoped kinds use `stage_id`, the others ignore it.
    async fn increment_sequences(
        &self,
        branch_id: i64,
        stage_id: Option<i64>,
        kinds: &[SeqKind],
    ) -> Result<Vec<i64>, CoreError>;

    // ------------------------------------------------------------------
    // Flows
    // ------------------------------------------------------------------

    /// Create a flow in progress.
    async fn create_flow(
        &self,
        flow: &NewFlow,
        now: DateTime<Utc>,
    ) -> Result<FlowRecord, CoreError>;

    /// Get a flow by id.
    async fn get_flow(&self, id: i64) -> Result<Option<FlowRecord>, CoreError>;

    /// Replace flow args and label.
    async fn update_flow_args(
        &self,
        flow_id: i64,
        args: &Value,
        label: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Most recent flow of a branch, optionally of one kind.
    async fn last_flow(
        &self,
        branch_id: i64,
        kind: Option<FlowKind>,
    ) -> Result<Option<FlowRecord>, CoreError>;

    /// Most recent completed flow of a branch and kind.
    async fn last_completed_flow(
        &self,
        branch_id: i64,
        kind: FlowKind,
    ) -> Result<Option<FlowRecord>, CoreError>;

    /// Mark a flow completed. Returns false if it already was.
    async fn complete_flow(&self, flow_id: i64, now: DateTime<Utc>) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Create a run in progress (not yet started).
    async fn create_run(&self, run: &NewRun, now: DateTime<Utc>)
    -> Result<RunRecord, CoreError>;

    /// Get a run by id.
    async fn get_run(&self, id: i64) -> Result<Option<RunRecord>, CoreError>;

    /// The run of a stage within a flow, if any.
    async fn find_run(&self, flow_id: i64, stage_id: i64) -> Result<Option<RunRecord>, CoreError>;

    /// Runs of a flow ordered by id.
    async fn list_flow_runs(&self, flow_id: i64) -> Result<Vec<RunRecord>, CoreError>;

    /// Store the planned args/label and move the run to `state`.
    async fn update_run_start(
        &self,
        run_id: i64,
        args: &Value,
        label: Option<&str>,
        state: RunState,
        started: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Complete a run. Returns false if it was already completed or processed.
    async fn complete_run(
        &self,
        run_id: i64,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Put a run back in progress (rerun, replay).
    async fn reopen_run(&self, run_id: i64) -> Result<(), CoreError>;

    /// Store run summary counters.
    async fn update_run_counters(
        &self,
        run_id: i64,
        counters: &RunCounters,
    ) -> Result<(), CoreError>;

    /// Store history counters and move the run to `Processed`.
    async fn mark_run_processed(
        &self,
        run_id: i64,
        counters: &HistoryCounters,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Runs currently in progress.
    async fn list_runs_in_progress(&self) -> Result<Vec<RunRecord>, CoreError>;

    /// The CI run of `stage_id` whose flow immediately precedes `flow_created`.
    async fn previous_ci_run(
        &self,
        stage_id: i64,
        flow_created: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError>;

    /// The CI run of `stage_id` whose flow immediately follows `flow_created`.
    async fn next_ci_run(
        &self,
        stage_id: i64,
        flow_created: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Jobs and steps
    // ------------------------------------------------------------------

    /// Create a job with its steps in one transaction.
    async fn create_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<JobRecord, CoreError>;

    /// Get a job by id.
    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, CoreError>;

    /// Jobs of a run ordered by id (covered ones included).
    async fn list_run_jobs(&self, run_id: i64) -> Result<Vec<JobRecord>, CoreError>;

    /// Steps of a job ordered by index.
    async fn list_job_steps(&self, job_id: i64) -> Result<Vec<StepRecord>, CoreError>;

    /// Move the run's prequeued jobs to queued. Returns how many moved.
    async fn queue_run_jobs(&self, run_id: i64) -> Result<u64, CoreError>;

    /// Queued, unassigned jobs in FIFO order.
    async fn list_waiting_jobs(&self) -> Result<Vec<WaitingJob>, CoreError>;

    /// Authorized, enabled, live agents without a job.
    async fn list_idle_agents(&self) -> Result<Vec<IdleAgent>, CoreError>;

    /// Atomically bind a queued job to an idle agent of its group.
    ///
    /// Returns false (and changes nothing) when any precondition fails: the
    /// job is not queued or already taken, the agent is not idle, or the agent
    /// is not a member of the job's group.
    async fn assign_job(
        &self,
        job_id: i64,
        agent_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Record the first step start; later calls keep the first timestamp.
    async fn mark_job_started(&self, job_id: i64, now: DateTime<Utc>) -> Result<(), CoreError>;

    /// Update status and result of one step.
    async fn update_step(
        &self,
        job_id: i64,
        idx: i32,
        status: StepStatus,
        result: &Value,
    ) -> Result<(), CoreError>;

    /// Replace the substituted fields of one step.
    async fn update_step_fields(&self, job_id: i64, idx: i32, fields: &Value)
    -> Result<(), CoreError>;

    /// `Assigned → ExecutingFinished`, clearing the agent's back-reference.
    /// Returns false if the job was not assigned.
    async fn finish_job_execution(&self, job_id: i64, now: DateTime<Utc>)
    -> Result<bool, CoreError>;

    /// Force or finish a job to `Completed` with `status`.
    ///
    /// Clears the agent back-reference when it still points at this job.
    /// Returns false (and changes nothing) when the job is already completed.
    async fn complete_job(
        &self,
        job_id: i64,
        status: CompletionStatus,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Mark jobs covered.
    async fn cover_jobs(&self, job_ids: &[i64]) -> Result<(), CoreError>;

    /// Cover `job_id`, clone it (with fresh steps) in `Queued`, and reopen its run.
    async fn rerun_job(&self, job_id: i64, now: DateTime<Utc>) -> Result<JobRecord, CoreError>;

    /// Jobs in `Assigned`.
    async fn list_assigned_jobs(&self) -> Result<Vec<JobRecord>, CoreError>;

    /// `(status, duration_secs)` of recent completed comparable jobs, newest first.
    /// Only `AllOk` and `JobTimeout` jobs are returned.
    async fn recent_job_durations(
        &self,
        query: &DurationQuery,
    ) -> Result<Vec<(CompletionStatus, i64)>, CoreError>;

    /// Previous comparable completed CI job that is not a broken build.
    async fn previous_job_for_issues(
        &self,
        query: &PriorJobQuery,
    ) -> Result<Option<JobRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Tools, systems, groups
    // ------------------------------------------------------------------

    /// Find a tool by name and exact version, or the latest version.
    async fn find_tool(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<ToolRecord>, CoreError>;

    /// Get a tool by id.
    async fn get_tool(&self, id: i64) -> Result<Option<ToolRecord>, CoreError>;

    /// Get a system by id.
    async fn get_system(&self, id: i64) -> Result<Option<SystemRecord>, CoreError>;

    /// Find or create the system `(name, executor)`.
    async fn ensure_system(&self, name: &str, executor: &str) -> Result<SystemRecord, CoreError>;

    /// Find a group by name, preferring the project-scoped one over a global one.
    async fn find_agents_group(
        &self,
        name: &str,
        project_id: Option<i64>,
    ) -> Result<Option<AgentsGroupRecord>, CoreError>;

    /// Get a group by id.
    async fn get_agents_group(&self, id: i64) -> Result<Option<AgentsGroupRecord>, CoreError>;

    /// Non-deleted groups with a deployment descriptor.
    async fn list_cloud_groups(&self) -> Result<Vec<AgentsGroupRecord>, CoreError>;

    /// Non-deleted agents of a group.
    async fn list_group_agents(&self, group_id: i64) -> Result<Vec<AgentRecord>, CoreError>;

    /// Queued, unassigned jobs of a group counted per system.
    async fn queued_backlog(&self, group_id: i64)
    -> Result<Vec<(SystemRecord, i64)>, CoreError>;

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Get an agent by id.
    async fn get_agent(&self, id: i64) -> Result<Option<AgentRecord>, CoreError>;

    /// Most recent agent row with this address, deleted ones included.
    async fn find_agent_by_address(&self, address: &str)
    -> Result<Option<AgentRecord>, CoreError>;

    /// Create (or undelete) an agent for an unknown address as unauthorized.
    async fn register_unknown_agent(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, CoreError>;

    /// Create an agent, optionally linked to a group.
    async fn create_agent(
        &self,
        agent: &NewAgent,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, CoreError>;

    /// Update `last_seen`.
    async fn touch_agent(&self, agent_id: i64, now: DateTime<Utc>) -> Result<(), CoreError>;

    /// Replace host info.
    async fn update_agent_host_info(&self, agent_id: i64, host_info: &Value)
    -> Result<(), CoreError>;

    /// Set the authorized/disabled flags.
    async fn set_agent_flags(
        &self,
        agent_id: i64,
        authorized: bool,
        disabled: bool,
    ) -> Result<(), CoreError>;

    /// Disable an agent with a status note.
    async fn disable_agent(&self, agent_id: i64, status_line: &str) -> Result<(), CoreError>;

    /// Soft-delete an agent and unlink it from its groups.
    async fn delete_agent(&self, agent_id: i64, now: DateTime<Utc>) -> Result<(), CoreError>;

    /// Clear the agent's job back-reference.
    async fn clear_agent_job(&self, agent_id: i64) -> Result<(), CoreError>;

    /// Non-deleted agents last seen before `cutoff` that are enabled or still hold a job.
    ///
    /// Agents that never checked in are left out; cloud machines may still be booting.
    async fn list_stale_agents(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<AgentRecord>, CoreError>;

    /// Completed-job statistics of an agent.
    async fn agent_job_stats(&self, agent_id: i64) -> Result<AgentJobStats, CoreError>;

    // ------------------------------------------------------------------
    // Results and issues
    // ------------------------------------------------------------------

    /// Upsert test cases by `(tool, name)` and their results by `(test_case, job)`.
    async fn record_test_results(
        &self,
        job_id: i64,
        tool_id: Option<i64>,
        results: &[NewTestResult],
    ) -> Result<usize, CoreError>;

    /// Results of a job ordered by id.
    async fn list_job_results(&self, job_id: i64)
    -> Result<Vec<TestCaseResultRecord>, CoreError>;

    /// Up to `limit` prior non-covered results of the same test case, group and
    /// system on the same branch in CI flows, oldest first.
    async fn result_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<TestCaseResultRecord>, CoreError>;

    /// Latest result of the test case in a completed CI job on the branch.
    async fn latest_ci_result(
        &self,
        query: &HistoryQuery,
    ) -> Result<Option<TestCaseResultRecord>, CoreError>;

    /// Store analysis output of a result.
    async fn update_result_analysis(
        &self,
        result_id: i64,
        change: ResultChange,
        age: i32,
        instability: i32,
        comment_id: Option<i64>,
    ) -> Result<(), CoreError>;

    /// Latest comment on `(test_case, branch)`.
    async fn latest_comment(
        &self,
        test_case_id: i64,
        branch_id: i64,
    ) -> Result<Option<TestCaseCommentRecord>, CoreError>;

    /// Append issues to a job.
    async fn record_issues(&self, job_id: i64, issues: &[NewIssue]) -> Result<usize, CoreError>;

    /// Issues of a job ordered by id.
    async fn list_job_issues(&self, job_id: i64) -> Result<Vec<IssueRecord>, CoreError>;

    /// Store the age of an issue.
    async fn update_issue_age(&self, issue_id: i64, age: i32) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Artifacts and user data
    // ------------------------------------------------------------------

    /// Append artifacts of a run. Returns how many rows were stored.
    async fn record_artifacts(
        &self,
        run_id: i64,
        section: ArtifactSection,
        artifacts: &[NewArtifact],
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError>;

    /// Artifacts of a run ordered by id.
    async fn list_run_artifacts(&self, run_id: i64) -> Result<Vec<ArtifactRecord>, CoreError>;

    /// Artifacts of every run of a flow ordered by id.
    async fn list_flow_artifacts(&self, flow_id: i64) -> Result<Vec<ArtifactRecord>, CoreError>;

    /// Replace a user data document. `id` names the project, branch or flow
    /// according to `scope`.
    async fn set_user_data(
        &self,
        scope: UserDataScope,
        id: i64,
        data: &Value,
    ) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Read a setting.
    async fn get_setting(&self, group: &str, name: &str) -> Result<Option<Value>, CoreError>;

    /// Write a setting.
    async fn set_setting(&self, group: &str, name: &str, value: &Value) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Work queue
    // ------------------------------------------------------------------

    /// Enqueue a task. Coalesced tasks may be parked as waiting or dropped;
    /// `None` means dropped.
    async fn enqueue_task(&self, task: &NewTask) -> Result<Option<TaskRecord>, CoreError>;

    /// Claim up to `limit` due pending tasks, moving them to running.
    async fn claim_tasks(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, CoreError>;

    /// Mark a task done and release a waiting task with the same key.
    async fn finish_task(&self, task_id: i64) -> Result<(), CoreError>;

    /// Put a task back to pending with one more attempt counted.
    async fn retry_task(
        &self,
        task_id: i64,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), CoreError>;

    /// Mark a task failed for good and release a waiting task with the same key.
    async fn fail_task(&self, task_id: i64, error: &str) -> Result<(), CoreError>;

    /// Count tasks per state (diagnostics and tests).
    async fn count_tasks(&self, state: TaskState) -> Result<i64, CoreError>;
}
