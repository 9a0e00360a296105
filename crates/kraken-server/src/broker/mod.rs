// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable background task broker.
//!
//! Tasks are rows in the `bg_tasks` table. Producers call [`Broker::enqueue`];
//! a [`BrokerWorker`] claims due rows and hands the decoded [`Task`] to a
//! [`TaskHandler`]. Selected kinds carry a coalescing key so a burst of
//! identical requests collapses into one running task plus at most one waiter
//! (see [`kraken_core::queue::admit`]).
//!
//! ```text
//! enqueue ──▶ pending ──claim──▶ running ──ok──▶ done
//!                ▲                  │
//!                └──retry(backoff)──┤
//!                                   └──fatal / attempts used──▶ failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kraken_core::model::FlowKind;
use kraken_core::persistence::{NewTask, Persistence, TaskRecord};
use kraken_core::queue::{coalesce_key, retry_backoff};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Default number of attempts of a task before it is failed for good.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 10;

/// Background work items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Webhook event for a project.
    TriggerFlow { project_id: i64, trigger: Value },
    /// Start a stage in a new flow (periodic triggers).
    TriggerRun {
        stage_id: i64,
        flow_kind: FlowKind,
        reason: Value,
    },
    /// A job left `Assigned`; analyze it.
    JobCompleted { job_id: i64 },
    AnalyzeRun { run_id: i64 },
    AnalyzeResultsHistory { run_id: i64 },
    /// Re-read the stage schema from its repository, then optionally finish
    /// starting a run.
    RefreshSchemaRepo {
        stage_id: i64,
        run_id: Option<i64>,
    },
    SpawnNewAgents { agents_group_id: i64 },
    DestroyMachine { agent_id: i64 },
    NotifyAboutStartedRun { run_id: i64 },
    NotifyAboutCompletedRun { run_id: i64 },
}

impl Task {
    /// Stable kind name, also the prefix of the coalescing key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TriggerFlow { .. } => "trigger_flow",
            Self::TriggerRun { .. } => "trigger_run",
            Self::JobCompleted { .. } => "job_completed",
            Self::AnalyzeRun { .. } => "analyze_run",
            Self::AnalyzeResultsHistory { .. } => "analyze_results_history",
            Self::RefreshSchemaRepo { .. } => "refresh_schema_repo",
            Self::SpawnNewAgents { .. } => "spawn_new_agents",
            Self::DestroyMachine { .. } => "destroy_machine",
            Self::NotifyAboutStartedRun { .. } => "notify_about_started_run",
            Self::NotifyAboutCompletedRun { .. } => "notify_about_completed_run",
        }
    }

    /// Coalescing key for kinds that go through the bottleneck.
    ///
    /// A schema refresh ignores the run it was requested for: one refresh
    /// serves every run waiting on the stage.
    pub fn coalesce_key(&self) -> Option<String> {
        match self {
            Self::AnalyzeRun { run_id } | Self::AnalyzeResultsHistory { run_id } => {
                Some(coalesce_key(self.kind(), &[run_id.to_string()], &[]))
            }
            Self::SpawnNewAgents { agents_group_id } => {
                Some(coalesce_key(self.kind(), &[agents_group_id.to_string()], &[]))
            }
            Self::RefreshSchemaRepo { stage_id, run_id } => Some(coalesce_key(
                self.kind(),
                &[
                    stage_id.to_string(),
                    run_id.map(|id| id.to_string()).unwrap_or_default(),
                ],
                &[1],
            )),
            _ => None,
        }
    }
}

/// Producer side of the work queue.
#[derive(Clone)]
pub struct Broker {
    persistence: Arc<dyn Persistence>,
    wakeup: Arc<Notify>,
    max_attempts: i32,
}

impl Broker {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            wakeup: Arc::new(Notify::new()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Signal raised on every accepted enqueue; workers wait on it between polls.
    pub fn wakeup_handle(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Enqueue a task due now. Returns false if the coalescer dropped it.
    pub async fn enqueue(&self, task: Task) -> Result<bool> {
        self.enqueue_at(task, Utc::now()).await
    }

    /// Enqueue a task due at `run_at`.
    pub async fn enqueue_at(&self, task: Task, run_at: DateTime<Utc>) -> Result<bool> {
        let new = NewTask {
            kind: task.kind().to_string(),
            payload: serde_json::to_value(&task)?,
            coalesce_key: task.coalesce_key(),
            run_at,
            max_attempts: self.max_attempts,
        };
        match self.persistence.enqueue_task(&new).await? {
            Some(record) => {
                debug!(task_id = record.id, kind = task.kind(), "Task enqueued");
                self.wakeup.notify_one();
                Ok(true)
            }
            None => {
                debug!(kind = task.kind(), key = ?new.coalesce_key, "Duplicate task dropped");
                Ok(false)
            }
        }
    }
}

/// Consumer of decoded tasks.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<()>;
}

/// Configuration for the broker worker.
#[derive(Debug, Clone)]
pub struct BrokerWorkerConfig {
    /// How often to poll for due tasks when not woken up.
    pub poll_interval: Duration,
    /// Maximum number of tasks handled at the same time.
    pub concurrency: usize,
}

impl Default for BrokerWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            concurrency: 4,
        }
    }
}

/// Background worker that drains the task table.
pub struct BrokerWorker {
    persistence: Arc<dyn Persistence>,
    handler: Arc<dyn TaskHandler>,
    wakeup: Arc<Notify>,
    config: BrokerWorkerConfig,
    permits: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl BrokerWorker {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        broker: &Broker,
        handler: Arc<dyn TaskHandler>,
        config: BrokerWorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            persistence,
            handler,
            wakeup: broker.wakeup_handle(),
            config,
            permits,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until shutdown. In-flight tasks are awaited.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            concurrency = self.config.concurrency,
            "Broker worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Broker worker received shutdown signal");
                    break;
                }

                _ = self.wakeup.notified() => {}

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.dispatch_due().await {
                error!(error = %e, "Failed to claim background tasks");
            }
        }

        // wait for in-flight handlers
        let all = self.config.concurrency.max(1) as u32;
        let _ = self.permits.acquire_many(all).await;
        info!("Broker worker stopped");
    }

    /// Claim as many due tasks as there are free slots and spawn them.
    ///
    /// Returns the number of tasks spawned.
    pub async fn dispatch_due(&self) -> Result<usize> {
        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let tasks = self.persistence.claim_tasks(free as i64, Utc::now()).await?;
        let count = tasks.len();
        for record in tasks {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let persistence = self.persistence.clone();
            let handler = self.handler.clone();
            let wakeup = self.wakeup.clone();
            tokio::spawn(async move {
                execute(persistence.as_ref(), handler.as_ref(), record).await;
                drop(permit);
                // a finished task may have released a waiting one
                wakeup.notify_one();
            });
        }
        Ok(count)
    }
}

/// Run one claimed task and record its outcome.
pub async fn execute(persistence: &dyn Persistence, handler: &dyn TaskHandler, record: TaskRecord) {
    let task: Task = match serde_json::from_value(record.payload.clone()) {
        Ok(task) => task,
        Err(e) => {
            error!(task_id = record.id, kind = %record.kind, error = %e, "Undecodable task payload");
            if let Err(e) = persistence.fail_task(record.id, &e.to_string()).await {
                error!(task_id = record.id, error = %e, "Failed to mark task failed");
            }
            return;
        }
    };

    let kind = task.kind();
    debug!(task_id = record.id, kind, attempt = record.attempts + 1, "Executing task");

    let outcome = match handler.handle(task).await {
        Ok(()) => persistence.finish_task(record.id).await,
        Err(e) if e.is_retryable() && record.attempts + 1 < record.max_attempts => {
            let delay = retry_backoff(record.attempts + 1);
            warn!(
                task_id = record.id,
                kind,
                error = %e,
                retry_in_secs = delay.as_secs(),
                "Task failed, will retry"
            );
            let run_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(300));
            persistence.retry_task(record.id, run_at, &e.to_string()).await
        }
        Err(e) => {
            error!(task_id = record.id, kind, error = %e, "Task failed");
            persistence.fail_task(record.id, &e.to_string()).await
        }
    };

    if let Err(e) = outcome {
        error!(task_id = record.id, kind, error = %e, "Failed to record task outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kraken_core::model::TaskState;
    use kraken_core::persistence::MemoryPersistence;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail_with: Option<fn() -> crate::error::Error>,
    }

    #[async_trait]
    impl TaskHandler for Counting {
        async fn handle(&self, _task: Task) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }
    }

    fn transient() -> crate::error::Error {
        kraken_core::CoreError::DatabaseError {
            operation: "select".into(),
            details: "connection reset".into(),
        }
        .into()
    }

    fn fatal() -> crate::error::Error {
        crate::error::Error::NotFound("run 1".into())
    }

    #[test]
    fn test_task_serialization_is_tagged() {
        let v = serde_json::to_value(Task::JobCompleted { job_id: 7 }).unwrap();
        assert_eq!(v, json!({"kind": "job_completed", "job_id": 7}));
        let back: Task = serde_json::from_value(v).unwrap();
        assert_eq!(back, Task::JobCompleted { job_id: 7 });
    }

    #[test]
    fn test_coalesce_keys() {
        assert_eq!(
            Task::AnalyzeRun { run_id: 3 }.coalesce_key().as_deref(),
            Some("analyze_run:3")
        );
        let a = Task::RefreshSchemaRepo {
            stage_id: 5,
            run_id: Some(10),
        };
        let b = Task::RefreshSchemaRepo {
            stage_id: 5,
            run_id: None,
        };
        assert_eq!(a.coalesce_key(), b.coalesce_key());
        assert_eq!(Task::JobCompleted { job_id: 1 }.coalesce_key(), None);
    }

    #[tokio::test]
    async fn test_duplicate_pending_task_dropped() {
        let p: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let broker = Broker::new(p.clone());
        assert!(broker.enqueue(Task::AnalyzeRun { run_id: 1 }).await.unwrap());
        assert!(!broker.enqueue(Task::AnalyzeRun { run_id: 1 }).await.unwrap());
        assert!(broker.enqueue(Task::AnalyzeRun { run_id: 2 }).await.unwrap());
        assert_eq!(p.count_tasks(TaskState::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_execute_finishes_task() {
        let p: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let broker = Broker::new(p.clone());
        broker.enqueue(Task::JobCompleted { job_id: 4 }).await.unwrap();
        let handler = Counting {
            calls: AtomicUsize::new(0),
            fail_with: None,
        };
        let claimed = p.claim_tasks(10, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        for record in claimed {
            execute(p.as_ref(), &handler, record).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.count_tasks(TaskState::Done).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_fatal_is_failed() {
        let p: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let broker = Broker::new(p.clone());
        broker.enqueue(Task::JobCompleted { job_id: 1 }).await.unwrap();
        let flaky = Counting {
            calls: AtomicUsize::new(0),
            fail_with: Some(transient),
        };
        for record in p.claim_tasks(10, Utc::now()).await.unwrap() {
            execute(p.as_ref(), &flaky, record).await;
        }
        assert_eq!(p.count_tasks(TaskState::Pending).await.unwrap(), 1);
        // backoff moves run_at into the future
        assert!(p.claim_tasks(10, Utc::now()).await.unwrap().is_empty());

        broker.enqueue(Task::DestroyMachine { agent_id: 1 }).await.unwrap();
        let broken = Counting {
            calls: AtomicUsize::new(0),
            fail_with: Some(fatal),
        };
        for record in p.claim_tasks(10, Utc::now()).await.unwrap() {
            execute(p.as_ref(), &broken, record).await;
        }
        assert_eq!(p.count_tasks(TaskState::Failed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_stops() {
        let p: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let broker = Broker::new(p.clone());
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_with: None,
        });
        let worker = BrokerWorker::new(
            p.clone(),
            &broker,
            handler.clone(),
            BrokerWorkerConfig {
                poll_interval: Duration::from_millis(10),
                concurrency: 2,
            },
        );
        for job_id in 0..5 {
            broker.enqueue(Task::JobCompleted { job_id }).await.unwrap();
        }
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(async move { worker.run().await });

        for _ in 0..200 {
            if p.count_tasks(TaskState::Done).await.unwrap() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.notify_one();
        handle.await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert_eq!(p.count_tasks(TaskState::Done).await.unwrap(), 5);
    }
}
