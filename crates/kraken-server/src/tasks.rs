// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routes broker tasks to the components that perform them.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::analyzer;
use crate::broker::{Task, TaskHandler};
use crate::context::ServerContext;
use crate::error::Result;
use crate::jobs;
use crate::planner;

/// [`TaskHandler`] backed by the server context.
#[derive(Clone)]
pub struct TaskDispatcher {
    ctx: ServerContext,
}

impl TaskDispatcher {
    pub fn new(ctx: ServerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TaskHandler for TaskDispatcher {
    async fn handle(&self, task: Task) -> Result<()> {
        let ctx = &self.ctx;
        debug!(kind = task.kind(), "Handling task");
        match task {
            Task::TriggerFlow {
                project_id,
                trigger,
            } => planner::trigger_flow(ctx, project_id, &trigger).await,
            Task::TriggerRun {
                stage_id,
                flow_kind,
                reason,
            } => {
                let run = planner::trigger_run(ctx, stage_id, flow_kind, reason).await?;
                info!(stage_id, run_id = run.id, "Run triggered");
                Ok(())
            }
            Task::JobCompleted { job_id } => jobs::handle_job_completed(ctx, job_id).await,
            Task::AnalyzeRun { run_id } => analyzer::analyze_run(ctx, run_id).await.map(drop),
            Task::AnalyzeResultsHistory { run_id } => {
                analyzer::analyze_results_history(ctx, run_id).await.map(drop)
            }
            // the refresh finishes starting every run waiting on the stage
            Task::RefreshSchemaRepo { stage_id, .. } => {
                planner::refresh_schema_repo(ctx, stage_id).await
            }
            Task::SpawnNewAgents { agents_group_id } => {
                let spawned = ctx.fleet.spawn_new_agents(agents_group_id).await?;
                debug!(agents_group_id, spawned, "Spawn pass done");
                Ok(())
            }
            Task::DestroyMachine { agent_id } => ctx.fleet.destroy_agent_machine(agent_id).await,
            Task::NotifyAboutStartedRun { run_id } => {
                analyzer::notify_about_run(ctx, run_id, "start").await
            }
            Task::NotifyAboutCompletedRun { run_id } => {
                analyzer::notify_about_run(ctx, run_id, "end").await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{seed, test_context};
    use chrono::Utc;
    use kraken_core::logstore::LogTable;
    use kraken_core::model::{CompletionStatus, JobState, StepStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_job_completed_task_completes_job() {
        let t = test_context();
        let s = seed(&t.ctx).await;
        let agent = s.agent(&t.ctx, "10.4.0.1", Utc::now()).await;
        let job = s.job(&t.ctx, 300, &[json!({"tool": "shell"})]).await;
        let p = &t.ctx.persistence;
        p.assign_job(job.id, agent.id, Utc::now()).await.unwrap();
        p.update_step(job.id, 0, StepStatus::Done, &json!({})).await.unwrap();
        p.finish_job_execution(job.id, Utc::now()).await.unwrap();

        let dispatcher = TaskDispatcher::new(t.ctx.clone());
        dispatcher.handle(Task::JobCompleted { job_id: job.id }).await.unwrap();

        let job = p.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.completion_status, Some(CompletionStatus::AllOk));
    }

    #[tokio::test]
    async fn test_notify_tasks_write_log_rows() {
        let t = test_context();
        let s = seed(&t.ctx).await;
        let dispatcher = TaskDispatcher::new(t.ctx.clone());
        dispatcher
            .handle(Task::NotifyAboutStartedRun { run_id: s.run_id })
            .await
            .unwrap();
        let rows = t.logs.rows(LogTable::Logs).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].message.contains("started"));
    }

    #[tokio::test]
    async fn test_missing_run_is_reported() {
        let t = test_context();
        let dispatcher = TaskDispatcher::new(t.ctx.clone());
        let err = dispatcher.handle(Task::AnalyzeRun { run_id: 999 }).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
