// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet manager: spawns and reclaims cloud agents of deployment-backed groups.
//!
//! Provider calls are slow, so no decision is taken while a provider call is
//! in flight: the agent row is updated first (disabled), then the provider is
//! called, then the row is reconciled (deleted). A crash in between leaves a
//! disabled agent which the next sweep picks up again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kraken_core::persistence::{AgentRecord, AgentsGroupRecord, NewAgent, Persistence, SystemRecord};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{
    CloudProvider, Deployment, MachineSpec, ProviderRegistry, agent_group_id, agent_machine_id,
};
use crate::error::{Error, Result};

/// Configuration of the fleet manager.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Public server URL baked into bootstrap scripts.
    pub server_url: String,
    /// Log store address handed to new agents.
    pub clickhouse_addr: Option<String>,
    /// Machines at the provider that no agent claims are terminated after this age.
    pub orphan_grace: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:6363".to_string(),
            clickhouse_addr: None,
            orphan_grace: Duration::from_secs(10 * 60),
        }
    }
}

/// Outcome of one sweep of a group.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Agents whose machines were destroyed (outdated, quota, disabled).
    pub destroyed: usize,
    /// Agents deleted because their machine disappeared.
    pub dangling: usize,
    /// Provider machines terminated because no agent claims them.
    pub orphans: usize,
}

/// Provisions and reclaims agents of cloud groups.
pub struct FleetManager {
    persistence: Arc<dyn Persistence>,
    providers: Arc<ProviderRegistry>,
    config: FleetConfig,
}

impl FleetManager {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        providers: Arc<ProviderRegistry>,
        config: FleetConfig,
    ) -> Self {
        Self {
            persistence,
            providers,
            config,
        }
    }

    async fn group_deployment(
        &self,
        group_id: i64,
    ) -> Result<Option<(AgentsGroupRecord, Deployment)>> {
        let Some(group) = self.persistence.get_agents_group(group_id).await? else {
            return Ok(None);
        };
        if group.deleted.is_some() {
            return Ok(None);
        }
        Ok(Deployment::of_group(&group).map(|d| (group, d)))
    }

    /// Create machines for the group's backlog.
    ///
    /// Per system: `min(queued - idle, instances_limit - live)` new machines.
    /// Returns the number of agents created.
    pub async fn spawn_new_agents(&self, group_id: i64) -> Result<usize> {
        let Some((group, deployment)) = self.group_deployment(group_id).await? else {
            debug!(group_id, "Group has no cloud deployment, nothing to spawn");
            return Ok(0);
        };
        let provider = self.providers.get(deployment.method)?;
        let backlog = self.persistence.queued_backlog(group_id).await?;
        if backlog.is_empty() {
            return Ok(0);
        }

        let mut live = self.persistence.list_group_agents(group_id).await?;
        let mut created = 0;
        for (system, queued) in backlog {
            let idle = live
                .iter()
                .filter(|a| a.job_id.is_none() && !a.disabled && serves_system(a, &system))
                .count() as i64;
            let room = deployment.instances_limit() - live.len() as i64;
            let count = (queued - idle).min(room);
            if count <= 0 {
                debug!(
                    group = %group.name,
                    system = %system.name,
                    queued,
                    idle,
                    room,
                    "No new agents needed"
                );
                continue;
            }

            let spec = MachineSpec {
                agents_group_id: group.id,
                agents_group_name: group.name.clone(),
                system: system.clone(),
                count: count as usize,
                server_url: self.config.server_url.clone(),
                clickhouse_addr: self.config.clickhouse_addr.clone(),
            };
            info!(group = %group.name, system = %system.name, count, "Spawning cloud agents");
            let machines = provider.create_machines(&deployment, &spec).await?;

            let served_system = if deployment.method.is_single_job() {
                system.id
            } else {
                spec.vm_system_id()
            };
            for machine in machines {
                let mut attrs = Map::new();
                attrs.insert("system".into(), Value::from(served_system));
                attrs.insert("machine_id".into(), Value::from(machine.machine_id.clone()));
                attrs.insert("group_id".into(), Value::from(group.id));
                attrs.insert("cloud".into(), serde_json::to_value(deployment.method)?);
                attrs.extend(machine.extra);
                let agent = self
                    .persistence
                    .create_agent(
                        &NewAgent {
                            name: machine.name,
                            address: machine.address,
                            ip_address: machine.ip_address,
                            extra_attrs: Value::Object(attrs),
                            authorized: false,
                            disabled: false,
                            agents_group_id: Some(group.id),
                        },
                        Utc::now(),
                    )
                    .await?;
                info!(agent_id = agent.id, machine = %machine.machine_id, "Cloud agent created");
                live.push(agent);
                created += 1;
            }
        }
        Ok(created)
    }

    /// After an agent finished a job: disable it if its jobs quota is reached.
    ///
    /// Returns true when the caller should enqueue the machine destruction.
    pub async fn retire_if_quota_reached(&self, agent_id: i64) -> Result<bool> {
        let Some(agent) = self.persistence.get_agent(agent_id).await? else {
            return Ok(false);
        };
        let Some(group_id) = agent_group_id(&agent) else {
            return Ok(false);
        };
        let Some((_, deployment)) = self.group_deployment(group_id).await? else {
            return Ok(false);
        };
        let quota = deployment.destruction_after_jobs();
        if quota == 0 {
            return Ok(false);
        }
        let stats = self.persistence.agent_job_stats(agent_id).await?;
        if stats.completed_jobs < quota {
            return Ok(false);
        }
        self.persistence
            .disable_agent(agent_id, "jobs quota reached, destroying")
            .await?;
        info!(agent_id, jobs = stats.completed_jobs, "Agent reached its jobs quota");
        Ok(true)
    }

    /// Destroy the machine of a cloud agent and delete the agent.
    pub async fn destroy_agent_machine(&self, agent_id: i64) -> Result<()> {
        let agent = self
            .persistence
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        if agent.deleted.is_some() {
            return Ok(());
        }
        let Some(group_id) = agent_group_id(&agent) else {
            warn!(agent_id, "Agent is not a cloud agent, not destroying");
            return Ok(());
        };
        let Some((_, deployment)) = self.group_deployment(group_id).await? else {
            warn!(agent_id, group_id, "Agent's group has no deployment anymore");
            return Ok(());
        };
        let provider = self.providers.get(deployment.method)?;
        self.destroy(provider.as_ref(), &deployment, &agent, "destroying")
            .await
    }

    async fn destroy(
        &self,
        provider: &dyn CloudProvider,
        deployment: &Deployment,
        agent: &AgentRecord,
        reason: &str,
    ) -> Result<()> {
        if !agent.disabled {
            self.persistence.disable_agent(agent.id, reason).await?;
        }
        if let Some(machine_id) = agent_machine_id(agent) {
            provider.destroy_machine(deployment, machine_id).await?;
            info!(agent_id = agent.id, machine = %machine_id, reason, "Cloud machine destroyed");
        }
        self.persistence.delete_agent(agent.id, Utc::now()).await?;
        Ok(())
    }

    /// Reclaim machines of one group.
    pub async fn sweep_group(&self, group_id: i64, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let Some((group, deployment)) = self.group_deployment(group_id).await? else {
            return Ok(report);
        };
        let provider = self.providers.get(deployment.method)?;
        let agents = self.persistence.list_group_agents(group_id).await?;

        let after_time = deployment.destruction_after_time();
        let after_jobs = deployment.destruction_after_jobs();
        let mut claimed = HashSet::new();

        for agent in &agents {
            let Some(machine_id) = agent_machine_id(agent) else {
                continue;
            };
            if agent.job_id.is_some() {
                claimed.insert(machine_id.to_string());
                continue;
            }

            let stats = self.persistence.agent_job_stats(agent.id).await?;
            let outdated = after_time > 0 && stats.completed_jobs > 0 && {
                let since = stats.last_finished.unwrap_or(agent.created).max(agent.created);
                now - since > chrono::Duration::minutes(after_time)
            };
            let quota = after_jobs > 0 && stats.completed_jobs >= after_jobs;

            let reason = if agent.disabled {
                Some("disabled")
            } else if outdated {
                Some("idle too long")
            } else if quota {
                Some("jobs quota reached")
            } else {
                None
            };

            if let Some(reason) = reason {
                match self.destroy(provider.as_ref(), &deployment, agent, reason).await {
                    Ok(()) => report.destroyed += 1,
                    Err(e) => {
                        warn!(agent_id = agent.id, error = %e, "Failed to destroy cloud machine");
                        claimed.insert(machine_id.to_string());
                    }
                }
                continue;
            }

            claimed.insert(machine_id.to_string());
            if !provider.machine_exists(&deployment, machine_id).await? {
                info!(agent_id = agent.id, machine = %machine_id, "Cloud machine is gone, deleting agent");
                self.persistence.delete_agent(agent.id, now).await?;
                report.dangling += 1;
            }
        }

        let grace = chrono::Duration::from_std(self.config.orphan_grace)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        for machine in provider.list_machines(&deployment, group_id).await? {
            if machine.terminated || claimed.contains(&machine.machine_id) {
                continue;
            }
            let Some(created) = machine.created else {
                continue;
            };
            if now - created <= grace {
                continue;
            }
            info!(group = %group.name, machine = %machine.machine_id, "Terminating orphaned machine");
            provider.destroy_machine(&deployment, &machine.machine_id).await?;
            report.orphans += 1;
        }

        if report != SweepReport::default() {
            info!(
                group = %group.name,
                destroyed = report.destroyed,
                dangling = report.dangling,
                orphans = report.orphans,
                "Cloud group swept"
            );
        }
        Ok(report)
    }

    /// Sweep every cloud group; a failing group does not stop the others.
    pub async fn sweep_all(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut total = SweepReport::default();
        for group in self.persistence.list_cloud_groups().await? {
            match self.sweep_group(group.id, now).await {
                Ok(r) => {
                    total.destroyed += r.destroyed;
                    total.dangling += r.dangling;
                    total.orphans += r.orphans;
                }
                Err(e) => warn!(group = %group.name, error = %e, "Cloud sweep failed"),
            }
        }
        Ok(total)
    }
}

/// Whether a cloud agent can take jobs of `system`; 0 serves any system.
fn serves_system(agent: &AgentRecord, system: &SystemRecord) -> bool {
    match agent.extra_attrs.get("system").and_then(Value::as_i64) {
        Some(0) => true,
        Some(id) => id == system.id,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockProvider;
    use kraken_core::model::{CompletionStatus, DeploymentMethod, FlowKind, JobState};
    use kraken_core::persistence::{
        MemoryPersistence, NewAgentsGroup, NewBranch, NewFlow, NewJob, NewProject, NewRun,
        NewStage,
    };
    use serde_json::json;

    struct Fixture {
        p: Arc<MemoryPersistence>,
        provider: Arc<MockProvider>,
        fleet: FleetManager,
        group_id: i64,
        run_id: i64,
        system: SystemRecord,
    }

    async fn fixture(method: DeploymentMethod, settings: Value) -> Fixture {
        let p = Arc::new(MemoryPersistence::new());
        let section = match method {
            DeploymentMethod::AwsEc2 => "aws",
            DeploymentMethod::AwsEcsFargate => "aws_ecs_fargate",
            DeploymentMethod::AzureVm => "azure_vm",
            _ => "kubernetes",
        };
        let group = p
            .create_agents_group(&NewAgentsGroup {
                name: "cloud".into(),
                deployment: Some(json!({"method": method, section: settings})),
                ..Default::default()
            })
            .await
            .unwrap();
        let project = p
            .create_project(&NewProject {
                name: "p".into(),
                ..Default::default()
            })
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
            .create_stage(&NewStage {
                branch_id: branch.id,
                name: "tests".into(),
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
        let system = p.ensure_system("ami-123", "local").await.unwrap();

        let provider = Arc::new(MockProvider::new(method));
        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());
        let fleet = FleetManager::new(p.clone(), Arc::new(registry), FleetConfig::default());
        Fixture {
            p,
            provider,
            fleet,
            group_id: group.id,
            run_id: run.id,
            system,
        }
    }

    async fn queue_jobs(f: &Fixture, n: usize) {
        for i in 0..n {
            f.p.create_job(
                &NewJob {
                    run_id: f.run_id,
                    name: format!("job-{}", i),
                    agents_group_id: Some(f.group_id),
                    system_id: Some(f.system.id),
                    timeout: 600,
                    state: JobState::Queued,
                    completion_status: None,
                    notes: None,
                    steps: vec![],
                },
                Utc::now(),
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_spawn_covers_backlog_within_limit() {
        let f = fixture(DeploymentMethod::AwsEc2, json!({"instances_limit": 2})).await;
        queue_jobs(&f, 3).await;

        assert_eq!(f.fleet.spawn_new_agents(f.group_id).await.unwrap(), 2);
        let agents = f.p.list_group_agents(f.group_id).await.unwrap();
        assert_eq!(agents.len(), 2);
        for agent in &agents {
            assert!(!agent.authorized);
            assert_eq!(agent.extra_attrs["system"], f.system.id);
            assert_eq!(agent.extra_attrs["group_id"], f.group_id);
            assert_eq!(agent.extra_attrs["cloud"], "aws-ec2");
        }

        // limit reached, idle agents cover the rest
        assert_eq!(f.fleet.spawn_new_agents(f.group_id).await.unwrap(), 0);
        assert_eq!(f.provider.created_specs().len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_without_backlog_creates_nothing() {
        let f = fixture(DeploymentMethod::Kubernetes, json!({})).await;
        assert_eq!(f.fleet.spawn_new_agents(f.group_id).await.unwrap(), 0);
        assert!(f.provider.created_specs().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_cleanup_spares_claimed_machine() {
        let f = fixture(DeploymentMethod::AwsEc2, json!({})).await;
        queue_jobs(&f, 1).await;
        f.fleet.spawn_new_agents(f.group_id).await.unwrap();
        let agent = f.p.list_group_agents(f.group_id).await.unwrap().remove(0);
        let claimed = agent_machine_id(&agent).unwrap().to_string();

        let now = Utc::now();
        f.provider
            .insert_machine("i-orphan", f.group_id, now - chrono::Duration::minutes(15));
        f.provider
            .insert_machine("i-young", f.group_id, now - chrono::Duration::minutes(2));

        let report = f.fleet.sweep_group(f.group_id, now).await.unwrap();
        assert_eq!(report.orphans, 1);
        assert_eq!(f.provider.destroyed(), vec!["i-orphan".to_string()]);
        assert!(!f.provider.destroyed().contains(&claimed));
    }

    #[tokio::test]
    async fn test_dangling_agent_is_deleted() {
        let f = fixture(DeploymentMethod::AwsEc2, json!({})).await;
        queue_jobs(&f, 1).await;
        f.fleet.spawn_new_agents(f.group_id).await.unwrap();
        let agent = f.p.list_group_agents(f.group_id).await.unwrap().remove(0);
        // machine terminated behind our back
        f.provider
            .destroy_machine(
                &Deployment::parse(&json!({"method": "aws-ec2"})).unwrap(),
                agent_machine_id(&agent).unwrap(),
            )
            .await
            .unwrap();

        let report = f.fleet.sweep_group(f.group_id, Utc::now()).await.unwrap();
        assert_eq!(report.dangling, 1);
        assert!(f.p.get_agent(agent.id).await.unwrap().unwrap().deleted.is_some());
    }

    #[tokio::test]
    async fn test_quota_reached_destroys_machine() {
        let f = fixture(DeploymentMethod::AwsEc2, json!({"destruction_after_jobs": 1})).await;
        queue_jobs(&f, 1).await;
        f.fleet.spawn_new_agents(f.group_id).await.unwrap();
        let agent = f.p.list_group_agents(f.group_id).await.unwrap().remove(0);
        f.p.set_agent_flags(agent.id, true, false).await.unwrap();

        let job = f.p.list_run_jobs(f.run_id).await.unwrap().remove(0);
        assert!(f.p.assign_job(job.id, agent.id, Utc::now()).await.unwrap());
        f.p.complete_job(job.id, CompletionStatus::AllOk, None, Utc::now())
            .await
            .unwrap();

        assert!(f.fleet.retire_if_quota_reached(agent.id).await.unwrap());
        assert!(f.p.get_agent(agent.id).await.unwrap().unwrap().disabled);

        f.fleet.destroy_agent_machine(agent.id).await.unwrap();
        let machine = agent_machine_id(&agent).unwrap().to_string();
        assert_eq!(f.provider.destroyed(), vec![machine]);
        assert!(f.p.get_agent(agent.id).await.unwrap().unwrap().deleted.is_some());
    }

    #[tokio::test]
    async fn test_outdated_idle_agent_is_destroyed() {
        let f = fixture(DeploymentMethod::AzureVm, json!({"destruction_after_time": 5})).await;
        queue_jobs(&f, 1).await;
        f.fleet.spawn_new_agents(f.group_id).await.unwrap();
        let agent = f.p.list_group_agents(f.group_id).await.unwrap().remove(0);
        f.p.set_agent_flags(agent.id, true, false).await.unwrap();
        let job = f.p.list_run_jobs(f.run_id).await.unwrap().remove(0);
        f.p.assign_job(job.id, agent.id, Utc::now()).await.unwrap();
        f.p.complete_job(job.id, CompletionStatus::AllOk, None, Utc::now())
            .await
            .unwrap();

        // not yet outdated
        let report = f.fleet.sweep_group(f.group_id, Utc::now()).await.unwrap();
        assert_eq!(report.destroyed, 0);

        let later = Utc::now() + chrono::Duration::minutes(6);
        let report = f.fleet.sweep_group(f.group_id, later).await.unwrap();
        assert_eq!(report.destroyed, 1);
    }

    #[test]
    fn test_serves_system() {
        let mut agent = AgentRecord {
            id: 1,
            name: "a".into(),
            address: "a".into(),
            ip_address: None,
            authorized: true,
            disabled: false,
            deleted: None,
            created: Utc::now(),
            last_seen: None,
            host_info: json!({}),
            extra_attrs: json!({"system": 0}),
            job_id: None,
            status_line: None,
        };
        let sys = SystemRecord {
            id: 4,
            name: "img".into(),
            executor: "docker".into(),
        };
        assert!(serves_system(&agent, &sys));
        agent.extra_attrs = json!({"system": 5});
        assert!(!serves_system(&agent, &sys));
        agent.extra_attrs = json!({});
        assert!(!serves_system(&agent, &sys));
    }
}
