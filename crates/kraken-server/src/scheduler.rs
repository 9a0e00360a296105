// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler: binds queued jobs to idle agents.
//!
//! Each pass partitions idle agents by group and by `(group, system)` and
//! walks waiting jobs in FIFO order. Agents that have not reported a system
//! yet sit in the `fake` bucket of their groups, which serves typed jobs when
//! no matching agent is idle. The binding itself is one atomic
//! [`Persistence::assign_job`](kraken_core::persistence::Persistence::assign_job)
//! call; a lost race leaves the job queued for the next pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kraken_core::model::{ANY_SYSTEM, FAKE_SYSTEM};
use kraken_core::persistence::{IdleAgent, WaitingJob};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::context::ServerContext;
use crate::error::Result;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between passes when nobody wakes the scheduler up.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Pick an agent for every job that can get one, in job order.
///
/// Returns `(job_id, agent_id)` pairs; no agent appears twice.
pub fn plan_assignments(jobs: &[WaitingJob], agents: &[IdleAgent]) -> Vec<(i64, i64)> {
    let mut by_group: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut by_sys_group: HashMap<(i64, &str), Vec<i64>> = HashMap::new();
    for agent in agents {
        let system = agent.system.as_deref().unwrap_or(FAKE_SYSTEM);
        for group_id in &agent.group_ids {
            by_group.entry(*group_id).or_default().push(agent.agent_id);
            by_sys_group
                .entry((*group_id, system))
                .or_default()
                .push(agent.agent_id);
        }
    }

    let mut taken: HashSet<i64> = HashSet::new();
    let mut plan = Vec::new();
    for job in jobs {
        if taken.len() == agents.len() {
            break;
        }
        // image based executors run anywhere in the group
        let buckets: Vec<(i64, &str)> = if job.system_name == ANY_SYSTEM || job.executor != "local" {
            Vec::new()
        } else {
            vec![
                (job.agents_group_id, job.system_name.as_str()),
                (job.agents_group_id, FAKE_SYSTEM),
            ]
        };

        let mut chosen = None;
        if buckets.is_empty() {
            if let Some(idle) = by_group.get_mut(&job.agents_group_id) {
                chosen = pop_free(idle, &taken);
            }
        } else {
            for key in buckets {
                if let Some(idle) = by_sys_group.get_mut(&key) {
                    chosen = pop_free(idle, &taken);
                }
                if chosen.is_some() {
                    break;
                }
            }
        }

        match chosen {
            Some(agent_id) => {
                taken.insert(agent_id);
                plan.push((job.job_id, agent_id));
            }
            None => debug!(job_id = job.job_id, group_id = job.agents_group_id, system = %job.system_name, "No idle agent for job"),
        }
    }
    plan
}

fn pop_free(idle: &mut Vec<i64>, taken: &HashSet<i64>) -> Option<i64> {
    while let Some(agent_id) = idle.pop() {
        if !taken.contains(&agent_id) {
            return Some(agent_id);
        }
    }
    None
}

/// Background job scheduler.
pub struct Scheduler {
    ctx: ServerContext,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(ctx: ServerContext, config: SchedulerConfig) -> Self {
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
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Scheduler started"
        );
        let wakeup = self.ctx.scheduler_wakeup.clone();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }

                _ = wakeup.notified() => {}

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.assign_jobs().await {
                error!(error = %e, "Failed to assign jobs to agents");
            }
        }

        info!("Scheduler stopped");
    }

    /// One scheduling pass. Returns the number of jobs assigned.
    pub async fn assign_jobs(&self) -> Result<usize> {
        let agents = self.ctx.persistence.list_idle_agents().await?;
        if agents.is_empty() {
            debug!("No idle agents");
            return Ok(0);
        }
        let jobs = self.ctx.persistence.list_waiting_jobs().await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        debug!(idle_agents = agents.len(), waiting_jobs = jobs.len(), "Scheduling pass");

        let mut assigned = 0;
        for (job_id, agent_id) in plan_assignments(&jobs, &agents) {
            if self.ctx.persistence.assign_job(job_id, agent_id, Utc::now()).await? {
                info!(job_id, agent_id, "Job assigned to agent");
                assigned += 1;
            } else {
                debug!(job_id, agent_id, "Assignment lost a race, job stays queued");
            }
        }
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::test_context;
    use kraken_core::model::{FlowKind, JobState};
    use kraken_core::persistence::{
        NewAgent, NewAgentsGroup, NewBranch, NewFlow, NewJob, NewProject, NewRun,
    };
    use serde_json::json;

    fn job(id: i64, group: i64, system: &str, executor: &str) -> WaitingJob {
        WaitingJob {
            job_id: id,
            run_id: 1,
            agents_group_id: group,
            system_name: system.into(),
            executor: executor.into(),
        }
    }

    fn agent(id: i64, system: Option<&str>, groups: &[i64]) -> IdleAgent {
        IdleAgent {
            agent_id: id,
            system: system.map(str::to_string),
            group_ids: groups.to_vec(),
        }
    }

    #[test]
    fn test_config_default() {
        assert_eq!(SchedulerConfig::default().poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_one_job_one_agent() {
        let plan = plan_assignments(
            &[job(1, 10, "any", "local")],
            &[agent(100, Some("ubuntu"), &[10]), agent(101, Some("ubuntu"), &[10])],
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].0, 1);
    }

    #[test]
    fn test_system_must_match_or_fall_back_to_fake() {
        let agents = [agent(100, Some("centos"), &[10]), agent(101, None, &[10])];
        let plan = plan_assignments(&[job(1, 10, "ubuntu", "local")], &agents);
        assert_eq!(plan, vec![(1, 101)]);

        let typed = [agent(100, Some("centos"), &[10])];
        assert!(plan_assignments(&[job(1, 10, "ubuntu", "local")], &typed).is_empty());
    }

    #[test]
    fn test_agent_is_used_once_across_buckets() {
        let agents = [agent(100, Some("ubuntu"), &[10, 20])];
        let plan = plan_assignments(
            &[job(1, 10, "ubuntu", "local"), job(2, 20, "ubuntu", "local")],
            &agents,
        );
        assert_eq!(plan, vec![(1, 100)]);
    }

    #[test]
    fn test_container_jobs_ignore_agent_system() {
        let agents = [agent(100, Some("ubuntu"), &[10])];
        let plan = plan_assignments(&[job(1, 10, "alpine:3.19", "docker")], &agents);
        assert_eq!(plan, vec![(1, 100)]);
    }

    #[test]
    fn test_fifo_order_wins() {
        let agents = [agent(100, Some("ubuntu"), &[10])];
        let plan = plan_assignments(
            &[job(5, 10, "ubuntu", "local"), job(3, 10, "ubuntu", "local")],
            &agents,
        );
        assert_eq!(plan, vec![(5, 100)]);
    }

    #[tokio::test]
    async fn test_pass_assigns_exactly_one_agent() {
        let t = test_context();
        let p = t.ctx.persistence.clone();
        let now = Utc::now();
        let project = p
            .create_project(&NewProject { name: "kraken".into(), ..Default::default() })
            .await
            .unwrap();
        let branch = p
            .create_branch(&NewBranch {
                project_id: project.id,
                name: "main".into(),
                branch_name: "main".into(),
            })
            .await
            .unwrap();
        let stage = p
            .create_stage(&kraken_core::persistence::NewStage {
                branch_id: branch.id,
                name: "tests".into(),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let flow = p
            .create_flow(
                &NewFlow { branch_id: branch.id, kind: FlowKind::Ci, args: json!({}), trigger_data: None },
                now,
            )
            .await
            .unwrap();
        let run = p
            .create_run(
                &NewRun { flow_id: flow.id, stage_id: stage.id, args: json!({}), reason: json!({}), repo_data: None },
                now,
            )
            .await
            .unwrap();
        let group = p
            .create_agents_group(&NewAgentsGroup { name: "G".into(), ..Default::default() })
            .await
            .unwrap();
        let mut agent_ids = Vec::new();
        for n in 0..2 {
            let a = p
                .create_agent(
                    &NewAgent {
                        name: format!("a{}", n),
                        address: format!("10.0.0.{}", n),
                        authorized: true,
                        agents_group_id: Some(group.id),
                        ..Default::default()
                    },
                    now,
                )
                .await
                .unwrap();
            agent_ids.push(a.id);
        }
        let system = p.ensure_system("any", "local").await.unwrap();
        let j = p
            .create_job(
                &NewJob {
                    run_id: run.id,
                    name: "J".into(),
                    agents_group_id: Some(group.id),
                    system_id: Some(system.id),
                    timeout: 300,
                    state: JobState::Queued,
                    completion_status: None,
                    notes: None,
                    steps: Vec::new(),
                },
                now,
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(t.ctx.clone(), SchedulerConfig::default());
        assert_eq!(scheduler.assign_jobs().await.unwrap(), 1);
        assert_eq!(scheduler.assign_jobs().await.unwrap(), 0);

        let j = p.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(j.state, JobState::Assigned);
        let owner = j.agent_used_id.unwrap();
        let mut holders = 0;
        for id in agent_ids {
            let a = p.get_agent(id).await.unwrap().unwrap();
            if a.job_id == Some(j.id) {
                holders += 1;
                assert_eq!(id, owner);
            } else {
                assert_eq!(a.job_id, None);
            }
        }
        assert_eq!(holders, 1);
    }
}
