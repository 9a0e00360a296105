// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence backend.
//!
//! State transitions of jobs, agents and tasks run inside one transaction each.
//! Scheduler assignment and task claiming lock rows with `FOR UPDATE SKIP LOCKED`
//! so several server processes can work the same tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use super::*;
use crate::error::CoreError;
use crate::model::{
    ArtifactSection, CommentState, CompletionStatus, FlowKind, FlowState, JobState, ResultChange,
    RunState, SeqKind, StepStatus, TaskState, UserDataScope,
};
use crate::queue;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Bind a queued job to an idle agent of its group.
///
/// The job row is taken with `SKIP LOCKED` so a concurrent scheduler simply
/// sees no candidate; the agent row is locked for the membership and idleness
/// checks.
pub async fn assign_job(
    pool: &PgPool,
    job_id: i64,
    agent_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let mut tx = pool.begin().await?;

    let job: Option<(i64, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT id, agents_group_id FROM jobs
        WHERE id = $1 AND state = $2 AND agent_used_id IS NULL AND NOT covered
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(job_id)
    .bind(JobState::Queued)
    .fetch_optional(&mut *tx)
    .await?;
    let Some((_, Some(group_id))) = job else {
        return Ok(false);
    };

    let agent: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT a.id FROM agents a
        JOIN agent_assignments aa ON aa.agent_id = a.id AND aa.agents_group_id = $2
        WHERE a.id = $1 AND a.job_id IS NULL AND a.authorized AND NOT a.disabled
          AND a.deleted IS NULL
        FOR UPDATE OF a
        "#,
    )
    .bind(agent_id)
    .bind(group_id)
    .fetch_optional(&mut *tx)
    .await?;
    if agent.is_none() {
        return Ok(false);
    }

    sqlx::query("UPDATE jobs SET state = $2, agent_used_id = $3, assigned = $4 WHERE id = $1")
        .bind(job_id)
        .bind(JobState::Assigned)
        .bind(agent_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE agents SET job_id = $2 WHERE id = $1")
        .bind(agent_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

/// Queued jobs in FIFO order of `(run.created, job.created)`.
pub async fn list_waiting_jobs(pool: &PgPool) -> Result<Vec<WaitingJob>, CoreError> {
    let rows: Vec<(i64, i64, i64, String, String)> = sqlx::query_as(
        r#"
        SELECT j.id, j.run_id, j.agents_group_id,
               COALESCE(s.name, 'any'), COALESCE(s.executor, 'local')
        FROM jobs j
        JOIN runs r ON r.id = j.run_id
        LEFT JOIN systems s ON s.id = j.system_id
        WHERE j.state = $1 AND j.agent_used_id IS NULL AND NOT j.covered
          AND j.agents_group_id IS NOT NULL
        ORDER BY r.created ASC, j.created ASC, j.id ASC
        "#,
    )
    .bind(JobState::Queued)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(job_id, run_id, agents_group_id, system_name, executor)| WaitingJob {
                job_id,
                run_id,
                agents_group_id,
                system_name,
                executor,
            },
        )
        .collect())
}

/// Idle agents with their group memberships.
pub async fn list_idle_agents(pool: &PgPool) -> Result<Vec<IdleAgent>, CoreError> {
    let rows: Vec<(i64, Option<String>, Vec<i64>)> = sqlx::query_as(
        r#"
        SELECT a.id, a.host_info->>'system',
               COALESCE(array_agg(aa.agents_group_id ORDER BY aa.agents_group_id)
                        FILTER (WHERE aa.agents_group_id IS NOT NULL), '{}')
        FROM agents a
        LEFT JOIN agent_assignments aa ON aa.agent_id = a.id
        WHERE a.job_id IS NULL AND a.authorized AND NOT a.disabled AND a.deleted IS NULL
        GROUP BY a.id
        ORDER BY a.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(agent_id, system, group_ids)| IdleAgent {
            agent_id,
            system: system.filter(|s| !s.is_empty()),
            group_ids,
        })
        .collect())
}

// ============================================================================
// Job transitions
// ============================================================================

/// Create a job and its steps.
pub async fn create_job(
    pool: &PgPool,
    job: &NewJob,
    now: DateTime<Utc>,
) -> Result<JobRecord, CoreError> {
    let mut tx = pool.begin().await?;
    let completed = (job.state == JobState::Completed).then_some(now);

    let rec: JobRecord = sqlx::query_as(
        r#"
        INSERT INTO jobs (run_id, name, state, completion_status, agents_group_id, system_id,
                          timeout, created, finished, completed, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, $10)
        RETURNING *
        "#,
    )
    .bind(job.run_id)
    .bind(&job.name)
    .bind(job.state)
    .bind(job.completion_status)
    .bind(job.agents_group_id)
    .bind(job.system_id)
    .bind(job.timeout)
    .bind(now)
    .bind(completed)
    .bind(&job.notes)
    .fetch_one(&mut *tx)
    .await?;

    for (idx, step) in job.steps.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO steps (job_id, idx, tool_id, fields_raw, fields, fields_masked, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(rec.id)
        .bind(idx as i32)
        .bind(step.tool_id)
        .bind(&step.fields_raw)
        .bind(&step.fields)
        .bind(&step.fields_masked)
        .bind(StepStatus::NotStarted)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(rec)
}

/// Move a job to `Completed` and release its agent.
pub async fn complete_job(
    pool: &PgPool,
    job_id: i64,
    status: CompletionStatus,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let mut tx = pool.begin().await?;

    let current: Option<(JobState, Option<i64>)> =
        sqlx::query_as("SELECT state, agent_used_id FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some((state, agent_used)) = current else {
        return Err(CoreError::not_found("job", job_id));
    };
    if state == JobState::Completed {
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE jobs
        SET state = $2, completion_status = $3, completed = $4,
            finished = COALESCE(finished, $4), notes = COALESCE($5, notes)
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(JobState::Completed)
    .bind(status)
    .bind(now)
    .bind(notes)
    .execute(&mut *tx)
    .await?;

    if let Some(agent_id) = agent_used {
        sqlx::query("UPDATE agents SET job_id = NULL WHERE id = $1 AND job_id = $2")
            .bind(agent_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// Cover a completed job and queue a fresh clone of it.
pub async fn rerun_job(
    pool: &PgPool,
    job_id: i64,
    now: DateTime<Utc>,
) -> Result<JobRecord, CoreError> {
    let mut tx = pool.begin().await?;

    let original: JobRecord = sqlx::query_as("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::not_found("job", job_id))?;
    if original.state != JobState::Completed {
        return Err(CoreError::invalid_state("job", job_id, "not completed"));
    }
    if original.covered {
        return Err(CoreError::invalid_state("job", job_id, "already covered"));
    }

    sqlx::query("UPDATE jobs SET covered = TRUE WHERE id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    let clone: JobRecord = sqlx::query_as(
        r#"
        INSERT INTO jobs (run_id, name, state, agents_group_id, system_id, timeout, created)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(original.run_id)
    .bind(&original.name)
    .bind(JobState::Queued)
    .bind(original.agents_group_id)
    .bind(original.system_id)
    .bind(original.timeout)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO steps (job_id, idx, tool_id, fields_raw, fields, fields_masked, status)
        SELECT $2, idx, tool_id, fields_raw, fields, fields_masked, $3
        FROM steps WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(clone.id)
    .bind(StepStatus::NotStarted)
    .execute(&mut *tx)
    .await?;

    reopen_run_tx(&mut tx, original.run_id).await?;

    tx.commit().await?;
    Ok(clone)
}

async fn reopen_run_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run_id: i64,
) -> Result<(), CoreError> {
    sqlx::query(
        "UPDATE runs SET state = $2, finished = NULL, processed_at = NULL WHERE id = $1",
    )
    .bind(run_id)
    .bind(RunState::InProgress)
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        r#"
        UPDATE flows SET state = $2, finished = NULL
        WHERE id = (SELECT flow_id FROM runs WHERE id = $1)
        "#,
    )
    .bind(run_id)
    .bind(FlowState::InProgress)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============================================================================
// Results
// ============================================================================

/// Upsert test cases and their results for one job.
pub async fn record_test_results(
    pool: &PgPool,
    job_id: i64,
    tool_id: Option<i64>,
    results: &[NewTestResult],
) -> Result<usize, CoreError> {
    let mut tx = pool.begin().await?;
    for res in results {
        let tc_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO test_cases (tool_id, name) VALUES ($1, $2)
            ON CONFLICT ((COALESCE(tool_id, 0)), name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(tool_id)
        .bind(&res.test_name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO test_case_results (test_case_id, job_id, result, cmd_line, "values", change)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (test_case_id, job_id) DO UPDATE
            SET result = EXCLUDED.result, cmd_line = EXCLUDED.cmd_line, "values" = EXCLUDED."values"
            "#,
        )
        .bind(tc_id)
        .bind(job_id)
        .bind(res.result)
        .bind(&res.cmd_line)
        .bind(&res.values)
        .bind(ResultChange::New)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(results.len())
}

/// Prior comparable results, oldest first.
pub async fn result_history(
    pool: &PgPool,
    query: &HistoryQuery,
) -> Result<Vec<TestCaseResultRecord>, CoreError> {
    let rows = sqlx::query_as::<_, TestCaseResultRecord>(
        r#"
        SELECT * FROM (
            SELECT tcr.*, f.created AS flow_created
            FROM test_case_results tcr
            JOIN jobs j ON j.id = tcr.job_id
            JOIN runs r ON r.id = j.run_id
            JOIN flows f ON f.id = r.flow_id
            WHERE tcr.test_case_id = $1 AND tcr.id <> $2 AND NOT j.covered
              AND j.agents_group_id IS NOT DISTINCT FROM $3
              AND j.system_id IS NOT DISTINCT FROM $4
              AND f.kind = $5 AND f.branch_id = $6 AND f.created <= $7
            ORDER BY f.created DESC, tcr.id DESC
            LIMIT $8
        ) h
        ORDER BY flow_created ASC, id ASC
        "#,
    )
    .bind(query.test_case_id)
    .bind(query.exclude_result_id)
    .bind(query.agents_group_id)
    .bind(query.system_id)
    .bind(FlowKind::Ci)
    .bind(query.branch_id)
    .bind(query.flow_created_before)
    .bind(query.limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ============================================================================
// Work queue
// ============================================================================

/// Insert a task, applying the coalescing admission rule for keyed tasks.
pub async fn enqueue_task(pool: &PgPool, task: &NewTask) -> Result<Option<TaskRecord>, CoreError> {
    let mut tx = pool.begin().await?;

    let state = match &task.coalesce_key {
        Some(key) => {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            let live: Vec<TaskState> = sqlx::query_scalar(
                "SELECT state FROM bg_tasks WHERE coalesce_key = $1 AND state IN ($2, $3, $4)",
            )
            .bind(key)
            .bind(TaskState::Pending)
            .bind(TaskState::Running)
            .bind(TaskState::Waiting)
            .fetch_all(&mut *tx)
            .await?;
            match queue::admit(&live).initial_state() {
                Some(state) => state,
                None => return Ok(None),
            }
        }
        None => TaskState::Pending,
    };

    let rec: TaskRecord = sqlx::query_as(
        r#"
        INSERT INTO bg_tasks (kind, payload, coalesce_key, state, max_attempts, run_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(&task.kind)
    .bind(&task.payload)
    .bind(&task.coalesce_key)
    .bind(state)
    .bind(task.max_attempts)
    .bind(task.run_at)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(rec))
}

/// Claim due pending tasks for this worker.
pub async fn claim_tasks(
    pool: &PgPool,
    limit: i64,
    now: DateTime<Utc>,
) -> Result<Vec<TaskRecord>, CoreError> {
    let mut rows = sqlx::query_as::<_, TaskRecord>(
        r#"
        UPDATE bg_tasks SET state = $1
        WHERE id IN (
            SELECT id FROM bg_tasks
            WHERE state = $2 AND run_at <= $3
            ORDER BY run_at, id
            LIMIT $4
            FOR UPDATE SKIP LOCKED
        )
        RETURNING *
        "#,
    )
    .bind(TaskState::Running)
    .bind(TaskState::Pending)
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.sort_by_key(|t| (t.run_at, t.id));
    Ok(rows)
}

async fn end_task(
    pool: &PgPool,
    task_id: i64,
    state: TaskState,
    error: Option<&str>,
) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;
    let key: Option<Option<String>> = sqlx::query_scalar(
        r#"
        UPDATE bg_tasks
        SET state = $2, last_error = COALESCE($3, last_error),
            attempts = attempts + CASE WHEN $3 IS NULL THEN 0 ELSE 1 END
        WHERE id = $1
        RETURNING coalesce_key
        "#,
    )
    .bind(task_id)
    .bind(state)
    .bind(error)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(key) = key else {
        return Err(CoreError::not_found("task", task_id));
    };
    if let Some(key) = key {
        sqlx::query(
            r#"
            UPDATE bg_tasks SET state = $2
            WHERE id = (
                SELECT id FROM bg_tasks WHERE coalesce_key = $1 AND state = $3
                ORDER BY id LIMIT 1
            )
            "#,
        )
        .bind(key)
        .bind(TaskState::Pending)
        .bind(TaskState::Waiting)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Persistence trait implementation
// ============================================================================

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn create_project(&self, project: &NewProject) -> Result<ProjectRecord, CoreError> {
        Ok(sqlx::query_as(
            "INSERT INTO projects (name, webhooks, user_data) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(&project.name)
        .bind(json_or_empty(&project.webhooks))
        .bind(json_or_empty(&project.user_data))
        .fetch_one(&self.pool)
        .await?)
    }

    async fn create_branch(&self, branch: &NewBranch) -> Result<BranchRecord, CoreError> {
        Ok(sqlx::query_as(
            "INSERT INTO branches (project_id, name, branch_name) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(branch.project_id)
        .bind(&branch.name)
        .bind(&branch.branch_name)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn create_stage(&self, stage: &NewStage) -> Result<StageRecord, CoreError> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO stages (branch_id, name, enabled, schema_code, schema,
                                schema_from_repo_enabled, repo_url, repo_branch,
                                repo_access_token, schema_file)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(stage.branch_id)
        .bind(&stage.name)
        .bind(stage.enabled)
        .bind(&stage.schema_code)
        .bind(json_or_empty(&stage.schema))
        .bind(stage.schema_from_repo_enabled)
        .bind(&stage.repo_url)
        .bind(&stage.repo_branch)
        .bind(&stage.repo_access_token)
        .bind(&stage.schema_file)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn create_tool(&self, tool: &NewTool) -> Result<ToolRecord, CoreError> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO tools (name, version, description, fields_schema, location, entry)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&tool.name)
        .bind(&tool.version)
        .bind(&tool.description)
        .bind(json_or_empty(&tool.fields_schema))
        .bind(&tool.location)
        .bind(&tool.entry)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn create_agents_group(
        &self,
        group: &NewAgentsGroup,
    ) -> Result<AgentsGroupRecord, CoreError> {
        Ok(sqlx::query_as(
            "INSERT INTO agents_groups (name, project_id, deployment) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(&group.name)
        .bind(group.project_id)
        .bind(&group.deployment)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn assign_agent_to_group(&self, agent_id: i64, group_id: i64) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_assignments (agent_id, agents_group_id) VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(agent_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_secret(&self, secret: &NewSecret) -> Result<SecretRecord, CoreError> {
        Ok(sqlx::query_as(
            "INSERT INTO secrets (project_id, name, kind, data) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(secret.project_id)
        .bind(&secret.name)
        .bind(secret.kind)
        .bind(&secret.data)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn create_test_case_comment(
        &self,
        test_case_id: i64,
        branch_id: i64,
        state: CommentState,
        data: &Value,
        now: DateTime<Utc>,
    ) -> Result<TestCaseCommentRecord, CoreError> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO test_case_comments (test_case_id, branch_id, state, data, created)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(test_case_id)
        .bind(branch_id)
        .bind(state)
        .bind(data)
        .bind(now)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_project(&self, id: i64) -> Result<Option<ProjectRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_branch(&self, id: i64) -> Result<Option<BranchRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM branches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_project_branches(
        &self,
        project_id: i64,
    ) -> Result<Vec<BranchRecord>, CoreError> {
        Ok(sqlx::query_as(
            "SELECT * FROM branches WHERE project_id = $1 AND deleted IS NULL ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_stage(&self, id: i64) -> Result<Option<StageRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM stages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_branch_stages(&self, branch_id: i64) -> Result<Vec<StageRecord>, CoreError> {
        Ok(sqlx::query_as(
            "SELECT * FROM stages WHERE branch_id = $1 AND deleted IS NULL ORDER BY id",
        )
        .bind(branch_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_enabled_stages(&self) -> Result<Vec<StageRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM stages WHERE enabled AND deleted IS NULL ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn update_stage_repo(
        &self,
        stage_id: i64,
        update: &StageRepoUpdate,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE stages
            SET schema_code = COALESCE($2, schema_code),
                schema = COALESCE($3, schema),
                repo_state = $4,
                repo_error = $5,
                repo_version = COALESCE($6, repo_version)
            WHERE id = $1
            "#,
        )
        .bind(stage_id)
        .bind(&update.schema_code)
        .bind(&update.schema)
        .bind(update.repo_state)
        .bind(&update.repo_error)
        .bind(&update.repo_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_stage_timeouts(
        &self,
        stage_id: i64,
        timeouts: &Value,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE stages SET timeouts = $2 WHERE id = $1")
            .bind(stage_id)
            .bind(timeouts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_stage_triggers(
        &self,
        stage_id: i64,
        triggers: &Value,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE stages SET triggers = $2 WHERE id = $1")
            .bind(stage_id)
            .bind(triggers)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_project_secrets(
        &self,
        project_id: i64,
    ) -> Result<Vec<SecretRecord>, CoreError> {
        Ok(sqlx::query_as(
            "SELECT * FROM secrets WHERE project_id = $1 AND deleted IS NULL ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn increment_sequences(
        &self,
        branch_id: i64,
        stage_id: Option<i64>,
        kinds: &[SeqKind],
    ) -> Result<Vec<i64>, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut values = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let scope = if kind.is_stage_scoped() {
                stage_id.unwrap_or(0)
            } else {
                0
            };
            let value: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO branch_sequences (branch_id, stage_id, kind, value)
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (branch_id, stage_id, kind)
                DO UPDATE SET value = branch_sequences.value + 1
                RETURNING value
                "#,
            )
            .bind(branch_id)
            .bind(scope)
            .bind(*kind)
            .fetch_one(&mut *tx)
            .await?;
            values.push(value);
        }
        tx.commit().await?;
        Ok(values)
    }

    async fn create_flow(
        &self,
        flow: &NewFlow,
        now: DateTime<Utc>,
    ) -> Result<FlowRecord, CoreError> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO flows (branch_id, kind, state, created, args, trigger_data)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(flow.branch_id)
        .bind(flow.kind)
        .bind(FlowState::InProgress)
        .bind(now)
        .bind(json_or_empty(&flow.args))
        .bind(&flow.trigger_data)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_flow(&self, id: i64) -> Result<Option<FlowRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM flows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_flow_args(
        &self,
        flow_id: i64,
        args: &Value,
        label: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE flows SET args = $2, label = COALESCE($3, label) WHERE id = $1")
            .bind(flow_id)
            .bind(args)
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_flow(
        &self,
        branch_id: i64,
        kind: Option<FlowKind>,
    ) -> Result<Option<FlowRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM flows
            WHERE branch_id = $1 AND ($2::INTEGER IS NULL OR kind = $2)
            ORDER BY created DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(branch_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn last_completed_flow(
        &self,
        branch_id: i64,
        kind: FlowKind,
    ) -> Result<Option<FlowRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM flows
            WHERE branch_id = $1 AND kind = $2 AND state = $3
            ORDER BY created DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(branch_id)
        .bind(kind)
        .bind(FlowState::Completed)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn complete_flow(&self, flow_id: i64, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let res = sqlx::query(
            "UPDATE flows SET state = $2, finished = $3 WHERE id = $1 AND state <> $2",
        )
        .bind(flow_id)
        .bind(FlowState::Completed)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn create_run(&self, run: &NewRun, now: DateTime<Utc>) -> Result<RunRecord, CoreError> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO runs (flow_id, stage_id, state, created, args, reason, repo_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(run.flow_id)
        .bind(run.stage_id)
        .bind(RunState::InProgress)
        .bind(now)
        .bind(json_or_empty(&run.args))
        .bind(json_or_empty(&run.reason))
        .bind(&run.repo_data)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_run(&self, id: i64) -> Result<Option<RunRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_run(&self, flow_id: i64, stage_id: i64) -> Result<Option<RunRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM runs WHERE flow_id = $1 AND stage_id = $2")
                .bind(flow_id)
                .bind(stage_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_flow_runs(&self, flow_id: i64) -> Result<Vec<RunRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM runs WHERE flow_id = $1 ORDER BY id")
                .bind(flow_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn update_run_start(
        &self,
        run_id: i64,
        args: &Value,
        label: Option<&str>,
        state: RunState,
        started: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE runs SET args = $2, label = $3, state = $4, started = COALESCE($5, started)
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(args)
        .bind(label)
        .bind(state)
        .bind(started)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: i64,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let res = sqlx::query(
            r#"
            UPDATE runs SET state = $2, finished = $3, note = COALESCE($4, note)
            WHERE id = $1 AND state NOT IN ($2, $5)
            "#,
        )
        .bind(run_id)
        .bind(RunState::Completed)
        .bind(now)
        .bind(note)
        .bind(RunState::Processed)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn reopen_run(&self, run_id: i64) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        reopen_run_tx(&mut tx, run_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_run_counters(
        &self,
        run_id: i64,
        counters: &RunCounters,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE runs
            SET tests_total = $2, tests_passed = $3, tests_not_run = $4,
                jobs_total = $5, jobs_error = $6, issues_total = $7
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(counters.tests_total)
        .bind(counters.tests_passed)
        .bind(counters.tests_not_run)
        .bind(counters.jobs_total)
        .bind(counters.jobs_error)
        .bind(counters.issues_total)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_run_processed(
        &self,
        run_id: i64,
        counters: &HistoryCounters,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE runs
            SET new_cnt = $2, no_change_cnt = $3, regr_cnt = $4, fix_cnt = $5,
                issues_new = $6, state = $7, processed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(counters.new_cnt)
        .bind(counters.no_change_cnt)
        .bind(counters.regr_cnt)
        .bind(counters.fix_cnt)
        .bind(counters.issues_new)
        .bind(RunState::Processed)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs_in_progress(&self) -> Result<Vec<RunRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM runs WHERE state = $1 ORDER BY id")
            .bind(RunState::InProgress)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn previous_ci_run(
        &self,
        stage_id: i64,
        flow_created: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT r.* FROM runs r JOIN flows f ON f.id = r.flow_id
            WHERE r.stage_id = $1 AND f.kind = $2 AND f.created < $3
            ORDER BY f.created DESC, r.id DESC
            LIMIT 1
            "#,
        )
        .bind(stage_id)
        .bind(FlowKind::Ci)
        .bind(flow_created)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn next_ci_run(
        &self,
        stage_id: i64,
        flow_created: DateTime<Utc>,
    ) -> Result<Option<RunRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT r.* FROM runs r JOIN flows f ON f.id = r.flow_id
            WHERE r.stage_id = $1 AND f.kind = $2 AND f.created > $3
            ORDER BY f.created ASC, r.id ASC
            LIMIT 1
            "#,
        )
        .bind(stage_id)
        .bind(FlowKind::Ci)
        .bind(flow_created)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn create_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<JobRecord, CoreError> {
        create_job(&self.pool, job, now).await
    }

    async fn get_job(&self, id: i64) -> Result<Option<JobRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_run_jobs(&self, run_id: i64) -> Result<Vec<JobRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM jobs WHERE run_id = $1 ORDER BY id")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn list_job_steps(&self, job_id: i64) -> Result<Vec<StepRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM steps WHERE job_id = $1 ORDER BY idx")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn queue_run_jobs(&self, run_id: i64) -> Result<u64, CoreError> {
        let res = sqlx::query("UPDATE jobs SET state = $2 WHERE run_id = $1 AND state = $3")
            .bind(run_id)
            .bind(JobState::Queued)
            .bind(JobState::Prequeued)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn list_waiting_jobs(&self) -> Result<Vec<WaitingJob>, CoreError> {
        list_waiting_jobs(&self.pool).await
    }

    async fn list_idle_agents(&self) -> Result<Vec<IdleAgent>, CoreError> {
        list_idle_agents(&self.pool).await
    }

    async fn assign_job(
        &self,
        job_id: i64,
        agent_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        assign_job(&self.pool, job_id, agent_id, now).await
    }

    async fn mark_job_started(&self, job_id: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query("UPDATE jobs SET started = COALESCE(started, $2) WHERE id = $1")
            .bind(job_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_step(
        &self,
        job_id: i64,
        idx: i32,
        status: StepStatus,
        result: &Value,
    ) -> Result<(), CoreError> {
        let res =
            sqlx::query("UPDATE steps SET status = $3, result = $4 WHERE job_id = $1 AND idx = $2")
                .bind(job_id)
                .bind(idx)
                .bind(status)
                .bind(result)
                .execute(&self.pool)
                .await?;
        if res.rows_affected() == 0 {
            return Err(CoreError::not_found("step", format!("{}/{}", job_id, idx)));
        }
        Ok(())
    }

    async fn update_step_fields(
        &self,
        job_id: i64,
        idx: i32,
        fields: &Value,
    ) -> Result<(), CoreError> {
        let res = sqlx::query("UPDATE steps SET fields = $3 WHERE job_id = $1 AND idx = $2")
            .bind(job_id)
            .bind(idx)
            .bind(fields)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(CoreError::not_found("step", format!("{}/{}", job_id, idx)));
        }
        Ok(())
    }

    async fn finish_job_execution(
        &self,
        job_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;
        let agent: Option<Option<i64>> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET state = $2, finished = $3
            WHERE id = $1 AND state = $4
            RETURNING agent_used_id
            "#,
        )
        .bind(job_id)
        .bind(JobState::ExecutingFinished)
        .bind(now)
        .bind(JobState::Assigned)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(agent) = agent else {
            return Ok(false);
        };
        if let Some(agent_id) = agent {
            sqlx::query("UPDATE agents SET job_id = NULL WHERE id = $1 AND job_id = $2")
                .bind(agent_id)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn complete_job(
        &self,
        job_id: i64,
        status: CompletionStatus,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        complete_job(&self.pool, job_id, status, notes, now).await
    }

    async fn cover_jobs(&self, job_ids: &[i64]) -> Result<(), CoreError> {
        sqlx::query("UPDATE jobs SET covered = TRUE WHERE id = ANY($1)")
            .bind(job_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rerun_job(&self, job_id: i64, now: DateTime<Utc>) -> Result<JobRecord, CoreError> {
        rerun_job(&self.pool, job_id, now).await
    }

    async fn list_assigned_jobs(&self) -> Result<Vec<JobRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM jobs WHERE state = $1 ORDER BY id")
            .bind(JobState::Assigned)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn recent_job_durations(
        &self,
        query: &DurationQuery,
    ) -> Result<Vec<(CompletionStatus, i64)>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT j.completion_status,
                   EXTRACT(EPOCH FROM (COALESCE(j.finished, j.completed)
                                       - COALESCE(j.started, j.assigned)))::BIGINT
            FROM jobs j JOIN runs r ON r.id = j.run_id
            WHERE r.stage_id = $1 AND j.name = $2
              AND j.agents_group_id IS NOT DISTINCT FROM $3
              AND j.system_id IS NOT DISTINCT FROM $4
              AND j.state = $5 AND NOT j.covered
              AND j.completion_status IN ($6, $7)
              AND COALESCE(j.started, j.assigned) IS NOT NULL
              AND COALESCE(j.finished, j.completed) IS NOT NULL
            ORDER BY j.completed DESC NULLS LAST, j.id DESC
            LIMIT $8
            "#,
        )
        .bind(query.stage_id)
        .bind(&query.name)
        .bind(query.agents_group_id)
        .bind(query.system_id)
        .bind(JobState::Completed)
        .bind(CompletionStatus::AllOk)
        .bind(CompletionStatus::JobTimeout)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn previous_job_for_issues(
        &self,
        query: &PriorJobQuery,
    ) -> Result<Option<JobRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT j.* FROM jobs j
            JOIN runs r ON r.id = j.run_id
            JOIN flows f ON f.id = r.flow_id
            WHERE r.stage_id = $1 AND j.name = $2
              AND j.agents_group_id IS NOT DISTINCT FROM $3
              AND j.system_id IS NOT DISTINCT FROM $4
              AND j.state = $5 AND NOT j.covered
              AND f.kind = $6 AND f.created < $7
              AND j.completion_status IS NOT NULL
              AND j.completion_status NOT IN ($8, $9, $10)
            ORDER BY f.created DESC, j.id DESC
            LIMIT 1
            "#,
        )
        .bind(query.stage_id)
        .bind(&query.name)
        .bind(query.agents_group_id)
        .bind(query.system_id)
        .bind(JobState::Completed)
        .bind(FlowKind::Ci)
        .bind(query.flow_created_before)
        .bind(CompletionStatus::AgentErrorReturned)
        .bind(CompletionStatus::JobTimeout)
        .bind(CompletionStatus::StepTimeout)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_tool(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<ToolRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM tools
            WHERE name = $1 AND deleted IS NULL AND ($2::TEXT IS NULL OR version = $2)
            ORDER BY created DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn get_tool(&self, id: i64) -> Result<Option<ToolRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM tools WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_system(&self, id: i64) -> Result<Option<SystemRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM systems WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn ensure_system(&self, name: &str, executor: &str) -> Result<SystemRecord, CoreError> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO systems (name, executor) VALUES ($1, $2)
            ON CONFLICT (name, executor) DO UPDATE SET name = EXCLUDED.name
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(executor)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn find_agents_group(
        &self,
        name: &str,
        project_id: Option<i64>,
    ) -> Result<Option<AgentsGroupRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM agents_groups
            WHERE name = $1 AND deleted IS NULL AND (project_id = $2 OR project_id IS NULL)
            ORDER BY (project_id IS NULL) ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn get_agents_group(&self, id: i64) -> Result<Option<AgentsGroupRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM agents_groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_cloud_groups(&self) -> Result<Vec<AgentsGroupRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM agents_groups
            WHERE deleted IS NULL AND deployment IS NOT NULL AND deployment <> 'null'::jsonb
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_group_agents(&self, group_id: i64) -> Result<Vec<AgentRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT a.* FROM agents a
            JOIN agent_assignments aa ON aa.agent_id = a.id
            WHERE aa.agents_group_id = $1 AND a.deleted IS NULL
            ORDER BY a.id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn queued_backlog(
        &self,
        group_id: i64,
    ) -> Result<Vec<(SystemRecord, i64)>, CoreError> {
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT s.id, s.name, s.executor, COUNT(*)
            FROM jobs j JOIN systems s ON s.id = j.system_id
            WHERE j.state = $1 AND j.agent_used_id IS NULL AND NOT j.covered
              AND j.agents_group_id = $2
            GROUP BY s.id, s.name, s.executor
            ORDER BY s.id
            "#,
        )
        .bind(JobState::Queued)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, executor, n)| (SystemRecord { id, name, executor }, n))
            .collect())
    }

    async fn get_agent(&self, id: i64) -> Result<Option<AgentRecord>, CoreError> {
        Ok(sqlx::query_as("SELECT * FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_agent_by_address(
        &self,
        address: &str,
    ) -> Result<Option<AgentRecord>, CoreError> {
        Ok(sqlx::query_as(
            "SELECT * FROM agents WHERE address = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn register_unknown_agent(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, CoreError> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<AgentRecord> = sqlx::query_as(
            "SELECT * FROM agents WHERE address = $1 ORDER BY id DESC LIMIT 1 FOR UPDATE",
        )
        .bind(address)
        .fetch_optional(&mut *tx)
        .await?;

        let rec: AgentRecord = match existing {
            Some(agent) if agent.deleted.is_some() => {
                sqlx::query_as(
                    r#"
                    UPDATE agents
                    SET deleted = NULL, authorized = FALSE, disabled = FALSE, job_id = NULL,
                        last_seen = $2
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(agent.id)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
            Some(agent) => {
                sqlx::query_as("UPDATE agents SET last_seen = $2 WHERE id = $1 RETURNING *")
                    .bind(agent.id)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    INSERT INTO agents (name, address, created, last_seen)
                    VALUES ($1, $1, $2, $2)
                    RETURNING *
                    "#,
                )
                .bind(address)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        Ok(rec)
    }

    async fn create_agent(
        &self,
        agent: &NewAgent,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, CoreError> {
        let mut tx = self.pool.begin().await?;
        let rec: AgentRecord = sqlx::query_as(
            r#"
            INSERT INTO agents (name, address, ip_address, authorized, disabled, created, extra_attrs)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(&agent.name)
        .bind(&agent.address)
        .bind(&agent.ip_address)
        .bind(agent.authorized)
        .bind(agent.disabled)
        .bind(now)
        .bind(json_or_empty(&agent.extra_attrs))
        .fetch_one(&mut *tx)
        .await?;
        if let Some(group_id) = agent.agents_group_id {
            sqlx::query("INSERT INTO agent_assignments (agent_id, agents_group_id) VALUES ($1, $2)")
                .bind(rec.id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rec)
    }

    async fn touch_agent(&self, agent_id: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query("UPDATE agents SET last_seen = $2 WHERE id = $1")
            .bind(agent_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_agent_host_info(
        &self,
        agent_id: i64,
        host_info: &Value,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE agents SET host_info = $2 WHERE id = $1")
            .bind(agent_id)
            .bind(host_info)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_agent_flags(
        &self,
        agent_id: i64,
        authorized: bool,
        disabled: bool,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE agents SET authorized = $2, disabled = $3 WHERE id = $1")
            .bind(agent_id)
            .bind(authorized)
            .bind(disabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disable_agent(&self, agent_id: i64, status_line: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE agents SET disabled = TRUE, status_line = $2 WHERE id = $1")
            .bind(agent_id)
            .bind(status_line)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_agent(&self, agent_id: i64, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE agents SET deleted = $2, disabled = TRUE WHERE id = $1")
            .bind(agent_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agent_assignments WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_agent_job(&self, agent_id: i64) -> Result<(), CoreError> {
        sqlx::query("UPDATE agents SET job_id = NULL WHERE id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_stale_agents(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AgentRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM agents
            WHERE deleted IS NULL AND last_seen < $1
              AND (NOT disabled OR job_id IS NOT NULL)
            ORDER BY id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn agent_job_stats(&self, agent_id: i64) -> Result<AgentJobStats, CoreError> {
        let (completed_jobs, last_finished): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MAX(COALESCE(finished, completed))
            FROM jobs WHERE agent_used_id = $1 AND state = $2
            "#,
        )
        .bind(agent_id)
        .bind(JobState::Completed)
        .fetch_one(&self.pool)
        .await?;
        Ok(AgentJobStats {
            completed_jobs,
            last_finished,
        })
    }

    async fn record_test_results(
        &self,
        job_id: i64,
        tool_id: Option<i64>,
        results: &[NewTestResult],
    ) -> Result<usize, CoreError> {
        record_test_results(&self.pool, job_id, tool_id, results).await
    }

    async fn list_job_results(
        &self,
        job_id: i64,
    ) -> Result<Vec<TestCaseResultRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM test_case_results WHERE job_id = $1 ORDER BY id")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn result_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<TestCaseResultRecord>, CoreError> {
        result_history(&self.pool, query).await
    }

    async fn latest_ci_result(
        &self,
        query: &HistoryQuery,
    ) -> Result<Option<TestCaseResultRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT tcr.* FROM test_case_results tcr
            JOIN jobs j ON j.id = tcr.job_id
            JOIN runs r ON r.id = j.run_id
            JOIN flows f ON f.id = r.flow_id
            WHERE tcr.test_case_id = $1 AND tcr.id <> $2 AND NOT j.covered AND j.state = $3
              AND j.agents_group_id IS NOT DISTINCT FROM $4
              AND j.system_id IS NOT DISTINCT FROM $5
              AND f.kind = $6 AND f.branch_id = $7
            ORDER BY f.created DESC, tcr.id DESC
            LIMIT 1
            "#,
        )
        .bind(query.test_case_id)
        .bind(query.exclude_result_id)
        .bind(JobState::Completed)
        .bind(query.agents_group_id)
        .bind(query.system_id)
        .bind(FlowKind::Ci)
        .bind(query.branch_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn update_result_analysis(
        &self,
        result_id: i64,
        change: ResultChange,
        age: i32,
        instability: i32,
        comment_id: Option<i64>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE test_case_results
            SET change = $2, age = $3, instability = $4, comment_id = $5
            WHERE id = $1
            "#,
        )
        .bind(result_id)
        .bind(change)
        .bind(age)
        .bind(instability)
        .bind(comment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_comment(
        &self,
        test_case_id: i64,
        branch_id: i64,
    ) -> Result<Option<TestCaseCommentRecord>, CoreError> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM test_case_comments
            WHERE test_case_id = $1 AND branch_id = $2
            ORDER BY created DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(test_case_id)
        .bind(branch_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn record_issues(&self, job_id: i64, issues: &[NewIssue]) -> Result<usize, CoreError> {
        let mut tx = self.pool.begin().await?;
        for issue in issues {
            sqlx::query(
                r#"
                INSERT INTO issues (job_id, issue_type, line, col, path, symbol, message, extra)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(job_id)
            .bind(issue.issue_type)
            .bind(issue.line)
            .bind(issue.col)
            .bind(&issue.path)
            .bind(&issue.symbol)
            .bind(&issue.message)
            .bind(json_or_empty(&issue.extra))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(issues.len())
    }

    async fn list_job_issues(&self, job_id: i64) -> Result<Vec<IssueRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM issues WHERE job_id = $1 ORDER BY id")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn update_issue_age(&self, issue_id: i64, age: i32) -> Result<(), CoreError> {
        sqlx::query("UPDATE issues SET age = $2 WHERE id = $1")
            .bind(issue_id)
            .bind(age)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_artifacts(
        &self,
        run_id: i64,
        section: ArtifactSection,
        artifacts: &[NewArtifact],
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let mut tx = self.pool.begin().await?;
        let flow_id: i64 = sqlx::query_scalar("SELECT flow_id FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("run", run_id))?;
        for artifact in artifacts {
            sqlx::query(
                r#"
                INSERT INTO artifacts (flow_id, run_id, section, path, size, report_entry, created)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(flow_id)
            .bind(run_id)
            .bind(section)
            .bind(&artifact.path)
            .bind(artifact.size)
            .bind(&artifact.report_entry)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(artifacts.len())
    }

    async fn list_run_artifacts(&self, run_id: i64) -> Result<Vec<ArtifactRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM artifacts WHERE run_id = $1 ORDER BY id")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn list_flow_artifacts(&self, flow_id: i64) -> Result<Vec<ArtifactRecord>, CoreError> {
        Ok(
            sqlx::query_as("SELECT * FROM artifacts WHERE flow_id = $1 ORDER BY id")
                .bind(flow_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn set_user_data(
        &self,
        scope: UserDataScope,
        id: i64,
        data: &Value,
    ) -> Result<(), CoreError> {
        let (sql, entity) = match scope {
            UserDataScope::Project => ("UPDATE projects SET user_data = $2 WHERE id = $1", "project"),
            UserDataScope::Branch => ("UPDATE branches SET user_data = $2 WHERE id = $1", "branch"),
            UserDataScope::BranchCi => {
                ("UPDATE branches SET user_data_ci = $2 WHERE id = $1", "branch")
            }
            UserDataScope::BranchDev => {
                ("UPDATE branches SET user_data_dev = $2 WHERE id = $1", "branch")
            }
            UserDataScope::Flow => ("UPDATE flows SET user_data = $2 WHERE id = $1", "flow"),
        };
        let done = sqlx::query(sql)
            .bind(id)
            .bind(data)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(CoreError::not_found(entity, id));
        }
        Ok(())
    }

    async fn get_setting(&self, group: &str, name: &str) -> Result<Option<Value>, CoreError> {
        Ok(
            sqlx::query_scalar(r#"SELECT value FROM settings WHERE "group" = $1 AND name = $2"#)
                .bind(group)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn set_setting(&self, group: &str, name: &str, value: &Value) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings ("group", name, value) VALUES ($1, $2, $3)
            ON CONFLICT ("group", name) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(group)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_task(&self, task: &NewTask) -> Result<Option<TaskRecord>, CoreError> {
        enqueue_task(&self.pool, task).await
    }

    async fn claim_tasks(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        claim_tasks(&self.pool, limit, now).await
    }

    async fn finish_task(&self, task_id: i64) -> Result<(), CoreError> {
        end_task(&self.pool, task_id, TaskState::Done, None).await
    }

    async fn retry_task(
        &self,
        task_id: i64,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE bg_tasks
            SET state = $2, attempts = attempts + 1, run_at = $3, last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(TaskState::Pending)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_task(&self, task_id: i64, error: &str) -> Result<(), CoreError> {
        end_task(&self.pool, task_id, TaskState::Failed, Some(error)).await
    }

    async fn count_tasks(&self, state: TaskState) -> Result<i64, CoreError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM bg_tasks WHERE state = $1")
                .bind(state)
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

/// JSON columns are NOT NULL; `Value::Null` from `Default` inputs becomes `{}`.
fn json_or_empty(value: &Value) -> Value {
    if value.is_null() {
        Value::Object(Default::default())
    } else {
        value.clone()
    }
}
