// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! All tables live behind one `tokio::sync::Mutex`; each trait call takes the
//! lock once, so every operation is atomic just like a transaction in the
//! PostgreSQL backend. Used as the test double for every server component.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::*;
use crate::error::CoreError;
use crate::model::{
    ArtifactSection, CommentState, CompletionStatus, FlowKind, FlowState, JobState, ResultChange,
    RunState, SeqKind, StepStatus, TaskState, UserDataScope,
};
use crate::queue;

#[derive(Default)]
struct Tables {
    next_id: i64,
    projects: BTreeMap<i64, ProjectRecord>,
    branches: BTreeMap<i64, BranchRecord>,
    stages: BTreeMap<i64, StageRecord>,
    flows: BTreeMap<i64, FlowRecord>,
    runs: BTreeMap<i64, RunRecord>,
    jobs: BTreeMap<i64, JobRecord>,
    steps: BTreeMap<i64, StepRecord>,
    tools: BTreeMap<i64, ToolRecord>,
    systems: BTreeMap<i64, SystemRecord>,
    agents: BTreeMap<i64, AgentRecord>,
    groups: BTreeMap<i64, AgentsGroupRecord>,
    assignments: BTreeSet<(i64, i64)>,
    test_cases: BTreeMap<i64, TestCaseRecord>,
    results: BTreeMap<i64, TestCaseResultRecord>,
    comments: BTreeMap<i64, TestCaseCommentRecord>,
    issues: BTreeMap<i64, IssueRecord>,
    artifacts: BTreeMap<i64, ArtifactRecord>,
    secrets: BTreeMap<i64, SecretRecord>,
    tasks: BTreeMap<i64, TaskRecord>,
    sequences: HashMap<(i64, Option<i64>, SeqKind), i64>,
    settings: HashMap<(String, String), Value>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn job_mut(&mut self, id: i64) -> Result<&mut JobRecord, CoreError> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("job", id))
    }

    fn run_mut(&mut self, id: i64) -> Result<&mut RunRecord, CoreError> {
        self.runs
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("run", id))
    }

    fn agent_mut(&mut self, id: i64) -> Result<&mut AgentRecord, CoreError> {
        self.agents
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("agent", id))
    }

    fn stage_mut(&mut self, id: i64) -> Result<&mut StageRecord, CoreError> {
        self.stages
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("stage", id))
    }

    fn task_mut(&mut self, id: i64) -> Result<&mut TaskRecord, CoreError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("task", id))
    }

    /// Flow of the run a job belongs to.
    fn job_flow(&self, job: &JobRecord) -> Option<(&RunRecord, &FlowRecord)> {
        let run = self.runs.get(&job.run_id)?;
        let flow = self.flows.get(&run.flow_id)?;
        Some((run, flow))
    }

    fn clear_agent_ref(&mut self, agent_id: Option<i64>, job_id: i64) {
        if let Some(agent) = agent_id.and_then(|a| self.agents.get_mut(&a)) {
            if agent.job_id == Some(job_id) {
                agent.job_id = None;
            }
        }
    }

    fn reopen_flow(&mut self, flow_id: i64) {
        if let Some(flow) = self.flows.get_mut(&flow_id) {
            flow.state = FlowState::InProgress;
            flow.finished = None;
        }
    }

    fn release_waiter(&mut self, key: Option<String>) {
        let Some(key) = key else { return };
        let waiter = self
            .tasks
            .values_mut()
            .filter(|t| {
                t.state == TaskState::Waiting && t.coalesce_key.as_deref() == Some(key.as_str())
            })
            .min_by_key(|t| t.id);
        if let Some(task) = waiter {
            task.state = TaskState::Pending;
        }
    }

    fn insert_steps(&mut self, job_id: i64, steps: impl IntoIterator<Item = NewStep>) {
        for (idx, step) in steps.into_iter().enumerate() {
            let id = self.id();
            self.steps.insert(
                id,
                StepRecord {
                    id,
                    job_id,
                    idx: idx as i32,
                    tool_id: step.tool_id,
                    fields_raw: step.fields_raw,
                    fields: step.fields,
                    fields_masked: step.fields_masked,
                    status: StepStatus::NotStarted,
                    result: json!({}),
                },
            );
        }
    }

    fn history_candidates<'a>(
        &'a self,
        query: &'a HistoryQuery,
    ) -> impl Iterator<Item = (&'a TestCaseResultRecord, &'a JobRecord, &'a FlowRecord)> + 'a {
        self.results.values().filter_map(move |r| {
            if r.test_case_id != query.test_case_id || r.id == query.exclude_result_id {
                return None;
            }
            let job = self.jobs.get(&r.job_id)?;
            if job.covered
                || job.agents_group_id != query.agents_group_id
                || job.system_id != query.system_id
            {
                return None;
            }
            let (_, flow) = self.job_flow(job)?;
            if flow.kind != FlowKind::Ci || flow.branch_id != query.branch_id {
                return None;
            }
            Some((r, job, flow))
        })
    }
}

/// Persistence backend holding everything in process memory.
#[derive(Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn create_project(&self, project: &NewProject) -> Result<ProjectRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let id = t.id();
        let rec = ProjectRecord {
            id,
            name: project.name.clone(),
            enabled: true,
            webhooks: project.webhooks.clone(),
            user_data: project.user_data.clone(),
            created: Utc::now(),
        };
        t.projects.insert(id, rec.clone());
        Ok(rec)
    }

    async fn create_branch(&self, branch: &NewBranch) -> Result<BranchRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if !t.projects.contains_key(&branch.project_id) {
            return Err(CoreError::not_found("project", branch.project_id));
        }
        let id = t.id();
        let rec = BranchRecord {
            id,
            project_id: branch.project_id,
            name: branch.name.clone(),
            branch_name: branch.branch_name.clone(),
            user_data: json!({}),
            user_data_ci: json!({}),
            user_data_dev: json!({}),
            created: Utc::now(),
            deleted: None,
        };
        t.branches.insert(id, rec.clone());
        Ok(rec)
    }

    async fn create_stage(&self, stage: &NewStage) -> Result<StageRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if !t.branches.contains_key(&stage.branch_id) {
            return Err(CoreError::not_found("branch", stage.branch_id));
        }
        let id = t.id();
        let rec = StageRecord {
            id,
            branch_id: stage.branch_id,
            name: stage.name.clone(),
            enabled: stage.enabled,
            schema_code: stage.schema_code.clone(),
            schema: stage.schema.clone(),
            schema_from_repo_enabled: stage.schema_from_repo_enabled,
            repo_url: stage.repo_url.clone(),
            repo_branch: stage.repo_branch.clone(),
            repo_access_token: stage.repo_access_token.clone(),
            schema_file: stage.schema_file.clone(),
            repo_state: None,
            repo_error: None,
            repo_version: None,
            timeouts: json!({}),
            triggers: json!({}),
            created: Utc::now(),
            deleted: None,
        };
        t.stages.insert(id, rec.clone());
        Ok(rec)
    }

    async fn create_tool(&self, tool: &NewTool) -> Result<ToolRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if t.tools
            .values()
            .any(|x| x.name == tool.name && x.version == tool.version && x.deleted.is_none())
        {
            return Err(CoreError::Conflict {
                details: format!("tool {}@{} already exists", tool.name, tool.version),
            });
        }
        let id = t.id();
        let rec = ToolRecord {
            id,
            name: tool.name.clone(),
            version: tool.version.clone(),
            description: tool.description.clone(),
            fields_schema: tool.fields_schema.clone(),
            location: tool.location.clone(),
            entry: tool.entry.clone(),
            created: Utc::now(),
            deleted: None,
        };
        t.tools.insert(id, rec.clone());
        Ok(rec)
    }

    async fn create_agents_group(
        &self,
        group: &NewAgentsGroup,
    ) -> Result<AgentsGroupRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let id = t.id();
        let rec = AgentsGroupRecord {
            id,
            name: group.name.clone(),
            project_id: group.project_id,
            deployment: group.deployment.clone(),
            created: Utc::now(),
            deleted: None,
        };
        t.groups.insert(id, rec.clone());
        Ok(rec)
    }

    async fn assign_agent_to_group(&self, agent_id: i64, group_id: i64) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        if !t.agents.contains_key(&agent_id) {
            return Err(CoreError::not_found("agent", agent_id));
        }
        if !t.groups.contains_key(&group_id) {
            return Err(CoreError::not_found("agents group", group_id));
        }
        t.assignments.insert((agent_id, group_id));
        Ok(())
    }

    async fn create_secret(&self, secret: &NewSecret) -> Result<SecretRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let id = t.id();
        let rec = SecretRecord {
            id,
            project_id: secret.project_id,
            name: secret.name.clone(),
            kind: secret.kind,
            data: secret.data.clone(),
            deleted: None,
        };
        t.secrets.insert(id, rec.clone());
        Ok(rec)
    }

    async fn create_test_case_comment(
        &self,
        test_case_id: i64,
        branch_id: i64,
        state: CommentState,
        data: &Value,
        now: DateTime<Utc>,
    ) -> Result<TestCaseCommentRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let id = t.id();
        let rec = TestCaseCommentRecord {
            id,
            test_case_id,
            branch_id,
            state,
            data: data.clone(),
            created: now,
        };
        t.comments.insert(id, rec.clone());
        Ok(rec)
    }

    async fn get_project(&self, id: i64) -> Result<Option<ProjectRecord>, CoreError> {
        Ok(self.tables.lock().await.projects.get(&id).cloned())
    }

    async fn get_branch(&self, id: i64) -> Result<Option<BranchRecord>, CoreError> {
        Ok(self.tables.lock().await.branches.get(&id).cloned())
    }

    async fn list_project_branches(
        &self,
        project_id: i64,
    ) -> Result<Vec<BranchRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.branches
            .values()
            .filter(|b| b.project_id == project_id && b.deleted.is_none())
            .cloned()
            .collect())
    }

    async fn get_stage(&self, id: i64) -> Result<Option<StageRecord>, CoreError> {
        Ok(self.tables.lock().await.stages.get(&id).cloned())
    }

    async fn list_branch_stages(&self, branch_id: i64) -> Result<Vec<StageRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.stages
            .values()
            .filter(|s| s.branch_id == branch_id && s.deleted.is_none())
            .cloned()
            .collect())
    }

    async fn list_enabled_stages(&self) -> Result<Vec<StageRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.stages
            .values()
            .filter(|s| s.enabled && s.deleted.is_none())
            .cloned()
            .collect())
    }

    async fn update_stage_repo(
        &self,
        stage_id: i64,
        update: &StageRepoUpdate,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let stage = t.stage_mut(stage_id)?;
        if let Some(code) = &update.schema_code {
            stage.schema_code = code.clone();
        }
        if let Some(schema) = &update.schema {
            stage.schema = schema.clone();
        }
        stage.repo_state = Some(update.repo_state);
        stage.repo_error = update.repo_error.clone();
        if let Some(version) = &update.repo_version {
            stage.repo_version = Some(version.clone());
        }
        Ok(())
    }

    async fn update_stage_timeouts(
        &self,
        stage_id: i64,
        timeouts: &Value,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        t.stage_mut(stage_id)?.timeouts = timeouts.clone();
        Ok(())
    }

    async fn update_stage_triggers(
        &self,
        stage_id: i64,
        triggers: &Value,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        t.stage_mut(stage_id)?.triggers = triggers.clone();
        Ok(())
    }

    async fn list_project_secrets(
        &self,
        project_id: i64,
    ) -> Result<Vec<SecretRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.secrets
            .values()
            .filter(|s| s.project_id == project_id && s.deleted.is_none())
            .cloned()
            .collect())
    }

    async fn increment_sequences(
        &self,
        branch_id: i64,
        stage_id: Option<i64>,
        kinds: &[SeqKind],
    ) -> Result<Vec<i64>, CoreError> {
        let mut t = self.tables.lock().await;
        let mut values = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let scope = if kind.is_stage_scoped() { stage_id } else { None };
            let value = t.sequences.entry((branch_id, scope, *kind)).or_insert(0);
            *value += 1;
            values.push(*value);
        }
        Ok(values)
    }

    async fn create_flow(
        &self,
        flow: &NewFlow,
        now: DateTime<Utc>,
    ) -> Result<FlowRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let id = t.id();
        let rec = FlowRecord {
            id,
            branch_id: flow.branch_id,
            kind: flow.kind,
            state: FlowState::InProgress,
            created: now,
            finished: None,
            args: flow.args.clone(),
            trigger_data: flow.trigger_data.clone(),
            label: None,
            user_data: json!({}),
        };
        t.flows.insert(id, rec.clone());
        Ok(rec)
    }

    async fn get_flow(&self, id: i64) -> Result<Option<FlowRecord>, CoreError> {
        Ok(self.tables.lock().await.flows.get(&id).cloned())
    }

    async fn update_flow_args(
        &self,
        flow_id: i64,
        args: &Value,
        label: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let flow = t
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| CoreError::not_found("flow", flow_id))?;
        flow.args = args.clone();
        if let Some(label) = label {
            flow.label = Some(label.to_string());
        }
        Ok(())
    }

    async fn last_flow(
        &self,
        branch_id: i64,
        kind: Option<FlowKind>,
    ) -> Result<Option<FlowRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.flows
            .values()
            .filter(|f| f.branch_id == branch_id && kind.is_none_or(|k| f.kind == k))
            .max_by_key(|f| (f.created, f.id))
            .cloned())
    }

    async fn last_completed_flow(
        &self,
        branch_id: i64,
        kind: FlowKind,
    ) -> Result<Option<FlowRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.flows
            .values()
            .filter(|f| {
                f.branch_id == branch_id && f.kind == kind && f.state == FlowState::Completed
            })
            .max_by_key(|f| (f.created, f.id))
            .cloned())
    }

    async fn complete_flow(&self, flow_id: i64, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let mut t = self.tables.lock().await;
        let flow = t
            .flows
            .get_mut(&flow_id)
            .ok_or_else(|| CoreError::not_found("flow", flow_id))?;
        if flow.state == FlowState::Completed {
            return Ok(false);
        }
        flow.state = FlowState::Completed;
        flow.finished = Some(now);
        Ok(true)
    }

    async fn create_run(&self, run: &NewRun, now: DateTime<Utc>) -> Result<RunRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if !t.flows.contains_key(&run.flow_id) {
            return Err(CoreError::not_found("flow", run.flow_id));
        }
        let id = t.id();
        let rec = RunRecord {
            id,
            flow_id: run.flow_id,
            stage_id: run.stage_id,
            state: RunState::InProgress,
            created: now,
            started: None,
            finished: None,
            processed_at: None,
            args: run.args.clone(),
            label: None,
            reason: run.reason.clone(),
            note: None,
            repo_data: run.repo_data.clone(),
            tests_total: 0,
            tests_passed: 0,
            tests_not_run: 0,
            jobs_total: 0,
            jobs_error: 0,
            issues_total: 0,
            issues_new: 0,
            new_cnt: 0,
            no_change_cnt: 0,
            regr_cnt: 0,
            fix_cnt: 0,
        };
        t.runs.insert(id, rec.clone());
        Ok(rec)
    }

    async fn get_run(&self, id: i64) -> Result<Option<RunRecord>, CoreError> {
        Ok(self.tables.lock().await.runs.get(&id).cloned())
    }

    async fn find_run(&self, flow_id: i64, stage_id: i64) -> Result<Option<RunRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.runs
            .values()
            .find(|r| r.flow_id == flow_id && r.stage_id == stage_id)
            .cloned())
    }

    async fn list_flow_runs(&self, flow_id: i64) -> Result<Vec<RunRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.runs
            .values()
            .filter(|r| r.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn update_run_start(
        &self,
        run_id: i64,
        args: &Value,
        label: Option<&str>,
        state: RunState,
        started: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let run = t.run_mut(run_id)?;
        run.args = args.clone();
        run.label = label.map(str::to_string);
        run.state = state;
        if started.is_some() {
            run.started = started;
        }
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: i64,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut t = self.tables.lock().await;
        let run = t.run_mut(run_id)?;
        if run.state.is_finished() {
            return Ok(false);
        }
        run.state = RunState::Completed;
        run.finished = Some(now);
        if let Some(note) = note {
            run.note = Some(note.to_string());
        }
        Ok(true)
    }

    async fn reopen_run(&self, run_id: i64) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let run = t.run_mut(run_id)?;
        run.state = RunState::InProgress;
        run.finished = None;
        run.processed_at = None;
        let flow_id = run.flow_id;
        t.reopen_flow(flow_id);
        Ok(())
    }

    async fn update_run_counters(
        &self,
        run_id: i64,
        counters: &RunCounters,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let run = t.run_mut(run_id)?;
        run.tests_total = counters.tests_total;
        run.tests_passed = counters.tests_passed;
        run.tests_not_run = counters.tests_not_run;
        run.jobs_total = counters.jobs_total;
        run.jobs_error = counters.jobs_error;
        run.issues_total = counters.issues_total;
        Ok(())
    }

    async fn mark_run_processed(
        &self,
        run_id: i64,
        counters: &HistoryCounters,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let run = t.run_mut(run_id)?;
        run.new_cnt = counters.new_cnt;
        run.no_change_cnt = counters.no_change_cnt;
        run.regr_cnt = counters.regr_cnt;
        run.fix_cnt = counters.fix_cnt;
        run.issues_new = counters.issues_new;
        run.state = RunState::Processed;
        run.processed_at = Some(now);
        Ok(())
    }

    async fn list_runs_in_progress(&self) -> Result<Vec<RunRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.runs
            .values()
            .filter(|r| r.state == RunState::InProgress)
            .cloned()
            .collect())
    }

    async fn previous_ci_run(
        &self,
        stage_id: i64,
        flow_created: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.runs
            .values()
            .filter_map(|r| {
                let flow = t.flows.get(&r.flow_id)?;
                (r.stage_id == stage_id && flow.kind == FlowKind::Ci && flow.created < flow_created)
                    .then_some((flow.created, r))
            })
            .max_by_key(|(created, r)| (*created, r.id))
            .map(|(_, r)| r.clone()))
    }

    async fn next_ci_run(
        &self,
        stage_id: i64,
        flow_created: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.runs
            .values()
            .filter_map(|r| {
                let flow = t.flows.get(&r.flow_id)?;
                (r.stage_id == stage_id && flow.kind == FlowKind::Ci && flow.created > flow_created)
                    .then_some((flow.created, r))
            })
            .min_by_key(|(created, r)| (*created, r.id))
            .map(|(_, r)| r.clone()))
    }

    async fn create_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<JobRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if !t.runs.contains_key(&job.run_id) {
            return Err(CoreError::not_found("run", job.run_id));
        }
        let id = t.id();
        let completed = (job.state == JobState::Completed).then_some(now);
        let rec = JobRecord {
            id,
            run_id: job.run_id,
            name: job.name.clone(),
            state: job.state,
            completion_status: job.completion_status,
            covered: false,
            agents_group_id: job.agents_group_id,
            system_id: job.system_id,
            agent_used_id: None,
            timeout: job.timeout,
            created: now,
            assigned: None,
            started: None,
            finished: completed,
            completed,
            notes: job.notes.clone(),
        };
        t.jobs.insert(id, rec.clone());
        t.insert_steps(id, job.steps.iter().cloned());
        Ok(rec)
    }

    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, CoreError> {
        Ok(self.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn list_run_jobs(&self, run_id: i64) -> Result<Vec<JobRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_job_steps(&self, job_id: i64) -> Result<Vec<StepRecord>, CoreError> {
        let t = self.tables.lock().await;
        let mut steps: Vec<_> = t
            .steps
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.idx);
        Ok(steps)
    }

    async fn queue_run_jobs(&self, run_id: i64) -> Result<u64, CoreError> {
        let mut t = self.tables.lock().await;
        let mut moved = 0;
        for job in t.jobs.values_mut() {
            if job.run_id == run_id && job.state == JobState::Prequeued {
                job.state = JobState::Queued;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn list_waiting_jobs(&self) -> Result<Vec<WaitingJob>, CoreError> {
        let t = self.tables.lock().await;
        let mut waiting: Vec<_> = t
            .jobs
            .values()
            .filter(|j| j.state == JobState::Queued && j.agent_used_id.is_none() && !j.covered)
            .filter_map(|j| {
                let group = j.agents_group_id?;
                let run = t.runs.get(&j.run_id)?;
                let (system_name, executor) = match j.system_id.and_then(|s| t.systems.get(&s)) {
                    Some(sys) => (sys.name.clone(), sys.executor.clone()),
                    None => (crate::model::ANY_SYSTEM.to_string(), "local".to_string()),
                };
                Some((
                    (run.created, j.created, j.id),
                    WaitingJob {
                        job_id: j.id,
                        run_id: j.run_id,
                        agents_group_id: group,
                        system_name,
                        executor,
                    },
                ))
            })
            .collect();
        waiting.sort_by_key(|(key, _)| *key);
        Ok(waiting.into_iter().map(|(_, w)| w).collect())
    }

    async fn list_idle_agents(&self) -> Result<Vec<IdleAgent>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.agents
            .values()
            .filter(|a| a.is_idle())
            .map(|a| IdleAgent {
                agent_id: a.id,
                system: a.declared_system().map(str::to_string),
                group_ids: t
                    .assignments
                    .iter()
                    .filter(|(agent, _)| *agent == a.id)
                    .map(|(_, group)| *group)
                    .collect(),
            })
            .collect())
    }

    async fn assign_job(
        &self,
        job_id: i64,
        agent_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut t = self.tables.lock().await;
        let Some(job) = t.jobs.get(&job_id) else {
            return Ok(false);
        };
        if job.state != JobState::Queued || job.agent_used_id.is_some() || job.covered {
            return Ok(false);
        }
        let Some(group) = job.agents_group_id else {
            return Ok(false);
        };
        match t.agents.get(&agent_id) {
            Some(agent) if agent.is_idle() => {}
            _ => return Ok(false),
        }
        if !t.assignments.contains(&(agent_id, group)) {
            return Ok(false);
        }

        let job = t.job_mut(job_id)?;
        job.state = JobState::Assigned;
        job.agent_used_id = Some(agent_id);
        job.assigned = Some(now);
        t.agent_mut(agent_id)?.job_id = Some(job_id);
        Ok(true)
    }

    async fn mark_job_started(&self, job_id: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let job = t.job_mut(job_id)?;
        if job.started.is_none() {
            job.started = Some(now);
        }
        Ok(())
    }

    async fn update_step(
        &self,
        job_id: i64,
        idx: i32,
        status: StepStatus,
        result: &Value,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let step = t
            .steps
            .values_mut()
            .find(|s| s.job_id == job_id && s.idx == idx)
            .ok_or_else(|| CoreError::not_found("step", format!("{}/{}", job_id, idx)))?;
        step.status = status;
        step.result = result.clone();
        Ok(())
    }

    async fn update_step_fields(
        &self,
        job_id: i64,
        idx: i32,
        fields: &Value,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let step = t
            .steps
            .values_mut()
            .find(|s| s.job_id == job_id && s.idx == idx)
            .ok_or_else(|| CoreError::not_found("step", format!("{}/{}", job_id, idx)))?;
        step.fields = fields.clone();
        Ok(())
    }

    async fn finish_job_execution(
        &self,
        job_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut t = self.tables.lock().await;
        let job = t.job_mut(job_id)?;
        if job.state != JobState::Assigned {
            return Ok(false);
        }
        job.state = JobState::ExecutingFinished;
        job.finished = Some(now);
        let agent = job.agent_used_id;
        t.clear_agent_ref(agent, job_id);
        Ok(true)
    }

    async fn complete_job(
        &self,
        job_id: i64,
        status: CompletionStatus,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut t = self.tables.lock().await;
        let job = t.job_mut(job_id)?;
        if job.state == JobState::Completed {
            return Ok(false);
        }
        job.state = JobState::Completed;
        job.completion_status = Some(status);
        job.completed = Some(now);
        job.finished.get_or_insert(now);
        if let Some(notes) = notes {
            job.notes = Some(notes.to_string());
        }
        let agent = job.agent_used_id;
        t.clear_agent_ref(agent, job_id);
        Ok(true)
    }

    async fn cover_jobs(&self, job_ids: &[i64]) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        for id in job_ids {
            t.job_mut(*id)?.covered = true;
        }
        Ok(())
    }

    async fn rerun_job(&self, job_id: i64, now: DateTime<Utc>) -> Result<JobRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let original = t
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("job", job_id))?;
        if original.state != JobState::Completed {
            return Err(CoreError::invalid_state("job", job_id, "not completed"));
        }
        if original.covered {
            return Err(CoreError::invalid_state("job", job_id, "already covered"));
        }
        t.job_mut(job_id)?.covered = true;

        let id = t.id();
        let clone = JobRecord {
            id,
            state: JobState::Queued,
            completion_status: None,
            covered: false,
            agent_used_id: None,
            created: now,
            assigned: None,
            started: None,
            finished: None,
            completed: None,
            notes: None,
            ..original
        };
        t.jobs.insert(id, clone.clone());

        let mut steps: Vec<_> = t
            .steps
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.idx);
        t.insert_steps(
            id,
            steps.into_iter().map(|s| NewStep {
                tool_id: s.tool_id,
                fields_raw: s.fields_raw,
                fields: s.fields,
                fields_masked: s.fields_masked,
            }),
        );

        let run = t.run_mut(clone.run_id)?;
        run.state = RunState::InProgress;
        run.finished = None;
        run.processed_at = None;
        let flow_id = run.flow_id;
        t.reopen_flow(flow_id);
        Ok(clone)
    }

    async fn list_assigned_jobs(&self) -> Result<Vec<JobRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.jobs
            .values()
            .filter(|j| j.state == JobState::Assigned)
            .cloned()
            .collect())
    }

    async fn recent_job_durations(
        &self,
        query: &DurationQuery,
    ) -> Result<Vec<(CompletionStatus, i64)>, CoreError> {
        let t = self.tables.lock().await;
        let mut rows: Vec<_> = t
            .jobs
            .values()
            .filter(|j| {
                j.name == query.name
                    && j.agents_group_id == query.agents_group_id
                    && j.system_id == query.system_id
                    && j.state == JobState::Completed
                    && !j.covered
                    && matches!(
                        j.completion_status,
                        Some(CompletionStatus::AllOk | CompletionStatus::JobTimeout)
                    )
                    && t.runs
                        .get(&j.run_id)
                        .is_some_and(|r| r.stage_id == query.stage_id)
            })
            .filter_map(|j| {
                let begin = j.started.or(j.assigned)?;
                let end = j.finished.or(j.completed)?;
                Some((
                    j.completed,
                    j.id,
                    j.completion_status?,
                    (end - begin).num_seconds(),
                ))
            })
            .collect();
        rows.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        Ok(rows
            .into_iter()
            .take(query.limit.max(0) as usize)
            .map(|(_, _, status, secs)| (status, secs))
            .collect())
    }

    async fn previous_job_for_issues(
        &self,
        query: &PriorJobQuery,
    ) -> Result<Option<JobRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.jobs
            .values()
            .filter(|j| {
                j.name == query.name
                    && j.agents_group_id == query.agents_group_id
                    && j.system_id == query.system_id
                    && j.state == JobState::Completed
                    && !j.covered
                    && j.completion_status.is_some_and(|s| !s.is_broken_build())
            })
            .filter_map(|j| {
                let (run, flow) = t.job_flow(j)?;
                (run.stage_id == query.stage_id
                    && flow.kind == FlowKind::Ci
                    && flow.created < query.flow_created_before)
                    .then_some(((flow.created, j.id), j))
            })
            .max_by_key(|(key, _)| *key)
            .map(|(_, j)| j.clone()))
    }

    async fn find_tool(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<ToolRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.tools
            .values()
            .filter(|x| x.name == name && x.deleted.is_none())
            .filter(|x| version.is_none_or(|v| x.version == v))
            .max_by_key(|x| (x.created, x.id))
            .cloned())
    }

    async fn get_tool(&self, id: i64) -> Result<Option<ToolRecord>, CoreError> {
        Ok(self.tables.lock().await.tools.get(&id).cloned())
    }

    async fn get_system(&self, id: i64) -> Result<Option<SystemRecord>, CoreError> {
        Ok(self.tables.lock().await.systems.get(&id).cloned())
    }

    async fn ensure_system(&self, name: &str, executor: &str) -> Result<SystemRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if let Some(sys) = t
            .systems
            .values()
            .find(|s| s.name == name && s.executor == executor)
        {
            return Ok(sys.clone());
        }
        let id = t.id();
        let rec = SystemRecord {
            id,
            name: name.to_string(),
            executor: executor.to_string(),
        };
        t.systems.insert(id, rec.clone());
        Ok(rec)
    }

    async fn find_agents_group(
        &self,
        name: &str,
        project_id: Option<i64>,
    ) -> Result<Option<AgentsGroupRecord>, CoreError> {
        let t = self.tables.lock().await;
        let live = || {
            t.groups
                .values()
                .filter(|g| g.name == name && g.deleted.is_none())
        };
        if let Some(pid) = project_id {
            if let Some(g) = live().find(|g| g.project_id == Some(pid)) {
                return Ok(Some(g.clone()));
            }
        }
        Ok(live().find(|g| g.project_id.is_none()).cloned())
    }

    async fn get_agents_group(&self, id: i64) -> Result<Option<AgentsGroupRecord>, CoreError> {
        Ok(self.tables.lock().await.groups.get(&id).cloned())
    }

    async fn list_cloud_groups(&self) -> Result<Vec<AgentsGroupRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.groups
            .values()
            .filter(|g| g.deleted.is_none() && g.deployment.as_ref().is_some_and(|d| !d.is_null()))
            .cloned()
            .collect())
    }

    async fn list_group_agents(&self, group_id: i64) -> Result<Vec<AgentRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.assignments
            .iter()
            .filter(|(_, g)| *g == group_id)
            .filter_map(|(a, _)| t.agents.get(a))
            .filter(|a| a.deleted.is_none())
            .cloned()
            .collect())
    }

    async fn queued_backlog(
        &self,
        group_id: i64,
    ) -> Result<Vec<(SystemRecord, i64)>, CoreError> {
        let t = self.tables.lock().await;
        let mut counts: BTreeMap<i64, i64> = BTreeMap::new();
        for job in t.jobs.values() {
            if job.state == JobState::Queued
                && job.agent_used_id.is_none()
                && !job.covered
                && job.agents_group_id == Some(group_id)
            {
                if let Some(sys) = job.system_id {
                    *counts.entry(sys).or_insert(0) += 1;
                }
            }
        }
        Ok(counts
            .into_iter()
            .filter_map(|(sys, n)| t.systems.get(&sys).map(|s| (s.clone(), n)))
            .collect())
    }

    async fn get_agent(&self, id: i64) -> Result<Option<AgentRecord>, CoreError> {
        Ok(self.tables.lock().await.agents.get(&id).cloned())
    }

    async fn find_agent_by_address(
        &self,
        address: &str,
    ) -> Result<Option<AgentRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.agents
            .values()
            .filter(|a| a.address == address)
            .max_by_key(|a| a.id)
            .cloned())
    }

    async fn register_unknown_agent(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let existing = t
            .agents
            .values()
            .filter(|a| a.address == address)
            .max_by_key(|a| a.id)
            .map(|a| a.id);
        if let Some(id) = existing {
            let agent = t.agent_mut(id)?;
            if agent.deleted.is_some() {
                agent.deleted = None;
                agent.authorized = false;
                agent.disabled = false;
                agent.job_id = None;
            }
            agent.last_seen = Some(now);
            return Ok(agent.clone());
        }
        let id = t.id();
        let rec = AgentRecord {
            id,
            name: address.to_string(),
            address: address.to_string(),
            ip_address: None,
            authorized: false,
            disabled: false,
            deleted: None,
            created: now,
            last_seen: Some(now),
            host_info: json!({}),
            extra_attrs: json!({}),
            job_id: None,
            status_line: None,
        };
        t.agents.insert(id, rec.clone());
        Ok(rec)
    }

    async fn create_agent(
        &self,
        agent: &NewAgent,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let id = t.id();
        let rec = AgentRecord {
            id,
            name: agent.name.clone(),
            address: agent.address.clone(),
            ip_address: agent.ip_address.clone(),
            authorized: agent.authorized,
            disabled: agent.disabled,
            deleted: None,
            created: now,
            last_seen: None,
            host_info: json!({}),
            extra_attrs: if agent.extra_attrs.is_null() {
                json!({})
            } else {
                agent.extra_attrs.clone()
            },
            job_id: None,
            status_line: None,
        };
        t.agents.insert(id, rec.clone());
        if let Some(group) = agent.agents_group_id {
            t.assignments.insert((id, group));
        }
        Ok(rec)
    }

    async fn touch_agent(&self, agent_id: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        t.agent_mut(agent_id)?.last_seen = Some(now);
        Ok(())
    }

    async fn update_agent_host_info(
        &self,
        agent_id: i64,
        host_info: &Value,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        t.agent_mut(agent_id)?.host_info = host_info.clone();
        Ok(())
    }

    async fn set_agent_flags(
        &self,
        agent_id: i64,
        authorized: bool,
        disabled: bool,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let agent = t.agent_mut(agent_id)?;
        agent.authorized = authorized;
        agent.disabled = disabled;
        Ok(())
    }

    async fn disable_agent(&self, agent_id: i64, status_line: &str) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let agent = t.agent_mut(agent_id)?;
        agent.disabled = true;
        agent.status_line = Some(status_line.to_string());
        Ok(())
    }

    async fn delete_agent(&self, agent_id: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let agent = t.agent_mut(agent_id)?;
        agent.deleted = Some(now);
        agent.disabled = true;
        t.assignments.retain(|(a, _)| *a != agent_id);
        Ok(())
    }

    async fn clear_agent_job(&self, agent_id: i64) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        t.agent_mut(agent_id)?.job_id = None;
        Ok(())
    }

    async fn list_stale_agents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AgentRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.agents
            .values()
            .filter(|a| a.deleted.is_none())
            .filter(|a| a.last_seen.is_some_and(|seen| seen < cutoff))
            .filter(|a| !a.disabled || a.job_id.is_some())
            .cloned()
            .collect())
    }

    async fn agent_job_stats(&self, agent_id: i64) -> Result<AgentJobStats, CoreError> {
        let t = self.tables.lock().await;
        let done: Vec<_> = t
            .jobs
            .values()
            .filter(|j| j.agent_used_id == Some(agent_id) && j.state == JobState::Completed)
            .collect();
        Ok(AgentJobStats {
            completed_jobs: done.len() as i64,
            last_finished: done.iter().filter_map(|j| j.finished.or(j.completed)).max(),
        })
    }

    async fn record_test_results(
        &self,
        job_id: i64,
        tool_id: Option<i64>,
        results: &[NewTestResult],
    ) -> Result<usize, CoreError> {
        let mut t = self.tables.lock().await;
        for res in results {
            let existing_tc = t
                .test_cases
                .values()
                .find(|tc| tc.tool_id == tool_id && tc.name == res.test_name)
                .map(|tc| tc.id);
            let tc_id = match existing_tc {
                Some(id) => id,
                None => {
                    let id = t.id();
                    t.test_cases.insert(
                        id,
                        TestCaseRecord {
                            id,
                            tool_id,
                            name: res.test_name.clone(),
                        },
                    );
                    id
                }
            };

            let existing = t
                .results
                .values_mut()
                .find(|r| r.test_case_id == tc_id && r.job_id == job_id);
            if let Some(r) = existing {
                r.result = res.result;
                r.cmd_line = res.cmd_line.clone();
                r.values = res.values.clone();
                continue;
            }
            let id = t.id();
            t.results.insert(
                id,
                TestCaseResultRecord {
                    id,
                    test_case_id: tc_id,
                    job_id,
                    result: res.result,
                    instability: 0,
                    age: 0,
                    change: ResultChange::New,
                    relevancy: 0,
                    cmd_line: res.cmd_line.clone(),
                    comment_id: None,
                    values: res.values.clone(),
                },
            );
        }
        Ok(results.len())
    }

    async fn list_job_results(
        &self,
        job_id: i64,
    ) -> Result<Vec<TestCaseResultRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.results
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn result_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<TestCaseResultRecord>, CoreError> {
        let t = self.tables.lock().await;
        let mut rows: Vec<_> = t
            .history_candidates(query)
            .filter(|(_, _, flow)| flow.created <= query.flow_created_before)
            .map(|(r, _, flow)| ((flow.created, r.id), r.clone()))
            .collect();
        rows.sort_by_key(|(key, _)| *key);
        let skip = rows.len().saturating_sub(query.limit.max(0) as usize);
        Ok(rows.into_iter().skip(skip).map(|(_, r)| r).collect())
    }

    async fn latest_ci_result(
        &self,
        query: &HistoryQuery,
    ) -> Result<Option<TestCaseResultRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.history_candidates(query)
            .filter(|(_, job, _)| job.state == JobState::Completed)
            .max_by_key(|(r, _, flow)| (flow.created, r.id))
            .map(|(r, _, _)| r.clone()))
    }

    async fn update_result_analysis(
        &self,
        result_id: i64,
        change: ResultChange,
        age: i32,
        instability: i32,
        comment_id: Option<i64>,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let r = t
            .results
            .get_mut(&result_id)
            .ok_or_else(|| CoreError::not_found("test case result", result_id))?;
        r.change = change;
        r.age = age;
        r.instability = instability;
        r.comment_id = comment_id;
        Ok(())
    }

    async fn latest_comment(
        &self,
        test_case_id: i64,
        branch_id: i64,
    ) -> Result<Option<TestCaseCommentRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.comments
            .values()
            .filter(|c| c.test_case_id == test_case_id && c.branch_id == branch_id)
            .max_by_key(|c| (c.created, c.id))
            .cloned())
    }

    async fn record_issues(&self, job_id: i64, issues: &[NewIssue]) -> Result<usize, CoreError> {
        let mut t = self.tables.lock().await;
        for issue in issues {
            let id = t.id();
            t.issues.insert(
                id,
                IssueRecord {
                    id,
                    job_id,
                    issue_type: issue.issue_type,
                    line: issue.line,
                    col: issue.col,
                    path: issue.path.clone(),
                    symbol: issue.symbol.clone(),
                    message: issue.message.clone(),
                    age: 0,
                    extra: issue.extra.clone(),
                },
            );
        }
        Ok(issues.len())
    }

    async fn list_job_issues(&self, job_id: i64) -> Result<Vec<IssueRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.issues
            .values()
            .filter(|i| i.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn update_issue_age(&self, issue_id: i64, age: i32) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        t.issues
            .get_mut(&issue_id)
            .ok_or_else(|| CoreError::not_found("issue", issue_id))?
            .age = age;
        Ok(())
    }

    async fn record_artifacts(
        &self,
        run_id: i64,
        section: ArtifactSection,
        artifacts: &[NewArtifact],
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let mut t = self.tables.lock().await;
        let flow_id = t.run_mut(run_id)?.flow_id;
        for artifact in artifacts {
            let id = t.id();
            t.artifacts.insert(
                id,
                ArtifactRecord {
                    id,
                    flow_id,
                    run_id,
                    section,
                    path: artifact.path.clone(),
                    size: artifact.size,
                    report_entry: artifact.report_entry.clone(),
                    created: now,
                },
            );
        }
        Ok(artifacts.len())
    }

    async fn list_run_artifacts(&self, run_id: i64) -> Result<Vec<ArtifactRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.artifacts
            .values()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_flow_artifacts(&self, flow_id: i64) -> Result<Vec<ArtifactRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.artifacts
            .values()
            .filter(|a| a.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn set_user_data(
        &self,
        scope: UserDataScope,
        id: i64,
        data: &Value,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let slot = match scope {
            UserDataScope::Project => t.projects.get_mut(&id).map(|p| &mut p.user_data),
            UserDataScope::Branch => t.branches.get_mut(&id).map(|b| &mut b.user_data),
            UserDataScope::BranchCi => t.branches.get_mut(&id).map(|b| &mut b.user_data_ci),
            UserDataScope::BranchDev => t.branches.get_mut(&id).map(|b| &mut b.user_data_dev),
            UserDataScope::Flow => t.flows.get_mut(&id).map(|f| &mut f.user_data),
        };
        let entity = match scope {
            UserDataScope::Project => "project",
            UserDataScope::Flow => "flow",
            _ => "branch",
        };
        *slot.ok_or_else(|| CoreError::not_found(entity, id))? = data.clone();
        Ok(())
    }

    async fn get_setting(&self, group: &str, name: &str) -> Result<Option<Value>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.settings
            .get(&(group.to_string(), name.to_string()))
            .cloned())
    }

    async fn set_setting(&self, group: &str, name: &str, value: &Value) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        t.settings
            .insert((group.to_string(), name.to_string()), value.clone());
        Ok(())
    }

    async fn enqueue_task(&self, task: &NewTask) -> Result<Option<TaskRecord>, CoreError> {
        let mut t = self.tables.lock().await;
        let state = match &task.coalesce_key {
            Some(key) => {
                let live: Vec<TaskState> = t
                    .tasks
                    .values()
                    .filter(|x| x.coalesce_key.as_deref() == Some(key.as_str()))
                    .map(|x| x.state)
                    .collect();
                match queue::admit(&live).initial_state() {
                    Some(state) => state,
                    None => return Ok(None),
                }
            }
            None => TaskState::Pending,
        };
        let id = t.id();
        let rec = TaskRecord {
            id,
            kind: task.kind.clone(),
            payload: task.payload.clone(),
            coalesce_key: task.coalesce_key.clone(),
            state,
            attempts: 0,
            max_attempts: task.max_attempts,
            run_at: task.run_at,
            created: Utc::now(),
            last_error: None,
        };
        t.tasks.insert(id, rec.clone());
        Ok(Some(rec))
    }

    async fn claim_tasks(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let mut t = self.tables.lock().await;
        let mut due: Vec<_> = t
            .tasks
            .values()
            .filter(|x| x.state == TaskState::Pending && x.run_at <= now)
            .map(|x| (x.run_at, x.id))
            .collect();
        due.sort();
        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit.max(0) as usize) {
            let task = t.task_mut(id)?;
            task.state = TaskState::Running;
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn finish_task(&self, task_id: i64) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let task = t.task_mut(task_id)?;
        task.state = TaskState::Done;
        let key = task.coalesce_key.clone();
        t.release_waiter(key);
        Ok(())
    }

    async fn retry_task(
        &self,
        task_id: i64,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let task = t.task_mut(task_id)?;
        task.state = TaskState::Pending;
        task.attempts += 1;
        task.run_at = run_at;
        task.last_error = Some(error.to_string());
        Ok(())
    }

    async fn fail_task(&self, task_id: i64, error: &str) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let task = t.task_mut(task_id)?;
        task.state = TaskState::Failed;
        task.attempts += 1;
        task.last_error = Some(error.to_string());
        let key = task.coalesce_key.clone();
        t.release_waiter(key);
        Ok(())
    }

    async fn count_tasks(&self, state: TaskState) -> Result<i64, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.tasks.values().filter(|x| x.state == state).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seed_run(p: &MemoryPersistence) -> (BranchRecord, StageRecord, RunRecord) {
        let project = p
            .create_project(&NewProject {
                name: "demo".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let branch = p
            .create_branch(&NewBranch {
                project_id: project.id,
                name: "master".into(),
                branch_name: "master".into(),
            })
            .await
            .unwrap();
        let stage = p
            .create_stage(&NewStage {
                branch_id: branch.id,
                name: "build".into(),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let flow = p
            .create_flow(
                &NewFlow {
                    branch_id: branch.id,
                    kind: FlowKind::Ci,
                    args: json!({}),
                    trigger_data: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let run = p
            .create_run(
                &NewRun {
                    flow_id: flow.id,
                    stage_id: stage.id,
                    args: json!({}),
                    reason: json!({"reason": "manual"}),
                    repo_data: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        (branch, stage, run)
    }

    fn new_job(run_id: i64, group: i64, steps: usize) -> NewJob {
        NewJob {
            run_id,
            name: "unit".into(),
            agents_group_id: Some(group),
            system_id: None,
            timeout: 120,
            state: JobState::Queued,
            completion_status: None,
            notes: None,
            steps: (0..steps)
                .map(|_| NewStep {
                    tool_id: None,
                    fields_raw: json!({}),
                    fields: json!({}),
                    fields_masked: json!({}),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_steps_are_gapless() {
        let p = MemoryPersistence::new();
        let (_, _, run) = seed_run(&p).await;
        let job = p.create_job(&new_job(run.id, 1, 3), Utc::now()).await.unwrap();
        let idx: Vec<i32> = p
            .list_job_steps(job.id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.idx)
            .collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_assign_requires_membership_and_idle_agent() {
        let p = MemoryPersistence::new();
        let (_, _, run) = seed_run(&p).await;
        let group = p
            .create_agents_group(&NewAgentsGroup {
                name: "all".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let job = p.create_job(&new_job(run.id, group.id, 1), Utc::now()).await.unwrap();
        let agent = p
            .create_agent(
                &NewAgent {
                    name: "a1".into(),
                    address: "10.0.0.1".into(),
                    authorized: true,
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(!p.assign_job(job.id, agent.id, Utc::now()).await.unwrap());

        p.assign_agent_to_group(agent.id, group.id).await.unwrap();
        assert!(p.assign_job(job.id, agent.id, Utc::now()).await.unwrap());

        let job = p.get_job(job.id).await.unwrap().unwrap();
        let agent = p.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Assigned);
        assert_eq!(job.agent_used_id, Some(agent.id));
        assert_eq!(agent.job_id, Some(job.id));

        assert!(!p.assign_job(job.id, agent.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_job_is_idempotent_and_clears_agent() {
        let p = MemoryPersistence::new();
        let (_, _, run) = seed_run(&p).await;
        let group = p
            .create_agents_group(&NewAgentsGroup {
                name: "all".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let agent = p
            .create_agent(
                &NewAgent {
                    name: "a1".into(),
                    address: "10.0.0.1".into(),
                    authorized: true,
                    agents_group_id: Some(group.id),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let job = p.create_job(&new_job(run.id, group.id, 1), Utc::now()).await.unwrap();
        assert!(p.assign_job(job.id, agent.id, Utc::now()).await.unwrap());

        let now = Utc::now();
        assert!(
            p.complete_job(job.id, CompletionStatus::JobTimeout, None, now)
                .await
                .unwrap()
        );
        assert!(
            !p.complete_job(job.id, CompletionStatus::AllOk, None, now)
                .await
                .unwrap()
        );

        let job = p.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.completion_status, Some(CompletionStatus::JobTimeout));
        assert_eq!(p.get_agent(agent.id).await.unwrap().unwrap().job_id, None);
    }

    #[tokio::test]
    async fn test_rerun_covers_and_reopens_run() {
        let p = MemoryPersistence::new();
        let (_, _, run) = seed_run(&p).await;
        let mut input = new_job(run.id, 1, 2);
        input.state = JobState::Completed;
        input.completion_status = Some(CompletionStatus::AllOk);
        let job = p.create_job(&input, Utc::now()).await.unwrap();
        assert!(p.complete_run(run.id, None, Utc::now()).await.unwrap());

        let clone = p.rerun_job(job.id, Utc::now()).await.unwrap();
        assert_eq!(clone.state, JobState::Queued);
        assert_eq!(clone.run_id, run.id);
        assert!(p.get_job(job.id).await.unwrap().unwrap().covered);
        assert_eq!(p.list_job_steps(clone.id).await.unwrap().len(), 2);
        assert_eq!(
            p.get_run(run.id).await.unwrap().unwrap().state,
            RunState::InProgress
        );
    }

    #[tokio::test]
    async fn test_sequences_are_scoped() {
        let p = MemoryPersistence::new();
        let v = p
            .increment_sequences(1, Some(10), &[SeqKind::Flow, SeqKind::Run])
            .await
            .unwrap();
        assert_eq!(v, vec![1, 1]);
        let v = p
            .increment_sequences(1, Some(11), &[SeqKind::Flow, SeqKind::Run])
            .await
            .unwrap();
        assert_eq!(v, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_task_coalescing() {
        let p = MemoryPersistence::new();
        let task = NewTask {
            kind: "analyze_run".into(),
            payload: json!({"run_id": 1}),
            coalesce_key: Some("analyze_run:1".into()),
            run_at: Utc::now() - Duration::seconds(1),
            max_attempts: 10,
        };
        let first = p.enqueue_task(&task).await.unwrap().unwrap();
        assert!(p.enqueue_task(&task).await.unwrap().is_none());

        let claimed = p.claim_tasks(10, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let waiting = p.enqueue_task(&task).await.unwrap().unwrap();
        assert_eq!(waiting.state, TaskState::Waiting);
        assert!(p.enqueue_task(&task).await.unwrap().is_none());

        p.finish_task(first.id).await.unwrap();
        assert_eq!(p.count_tasks(TaskState::Pending).await.unwrap(), 1);
        assert_eq!(p.count_tasks(TaskState::Done).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_is_ascending_and_limited() {
        let p = MemoryPersistence::new();
        let (branch, stage, _) = seed_run(&p).await;
        let base = Utc::now() - Duration::hours(1);
        let mut result_ids = Vec::new();
        for i in 0..4 {
            let flow = p
                .create_flow(
                    &NewFlow {
                        branch_id: branch.id,
                        kind: FlowKind::Ci,
                        args: json!({}),
                        trigger_data: None,
                    },
                    base + Duration::minutes(i),
                )
                .await
                .unwrap();
            let run = p
                .create_run(
                    &NewRun {
                        flow_id: flow.id,
                        stage_id: stage.id,
                        args: json!({}),
                        reason: json!({}),
                        repo_data: None,
                    },
                    flow.created,
                )
                .await
                .unwrap();
            let job = p.create_job(&new_job(run.id, 1, 0), flow.created).await.unwrap();
            p.record_test_results(
                job.id,
                None,
                &[NewTestResult {
                    test_name: "t".into(),
                    result: crate::model::TcResult::Passed,
                    cmd_line: None,
                    values: None,
                }],
            )
            .await
            .unwrap();
            result_ids.push(p.list_job_results(job.id).await.unwrap()[0].clone());
        }

        let current = result_ids.last().unwrap();
        let history = p
            .result_history(&HistoryQuery {
                test_case_id: current.test_case_id,
                branch_id: branch.id,
                agents_group_id: Some(1),
                system_id: None,
                flow_created_before: base + Duration::minutes(3),
                exclude_result_id: current.id,
                limit: 2,
            })
            .await
            .unwrap();
        let ids: Vec<i64> = history.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![result_ids[1].id, result_ids[2].id]);
    }
}
