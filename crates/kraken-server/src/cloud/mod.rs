// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud provisioning of agents.
//!
//! An agents group with a deployment descriptor is backed by machines that
//! the fleet manager creates and reclaims through a [`CloudProvider`]. Every
//! provider tags its machines with the group id so orphans can be found
//! later, and returns a machine id that is stored in the agent's
//! `extra_attrs.machine_id`.
//!
//! Deployment descriptor layout:
//!
//! ```json
//! {
//!   "method": "aws-ec2",
//!   "aws": {"region": "eu-central-1", "instance_type": "t3.micro",
//!           "instances_limit": 5, "destruction_after_jobs": 1,
//!           "destruction_after_time": 30, "init_script": "..."}
//! }
//! ```
//!
//! The settings section is named after the method: `aws` (EC2),
//! `aws_ecs_fargate`, `azure_vm` and `kubernetes`.

pub mod aws_ec2;
pub mod aws_fargate;
pub mod azure;
pub mod fleet;
pub mod k8s;
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kraken_core::model::DeploymentMethod;
use kraken_core::persistence::{AgentRecord, AgentsGroupRecord, SystemRecord};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::process::CommandError;

pub use fleet::FleetManager;
pub use mock::MockProvider;

/// Cloud provider errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// No provider is registered for the method.
    #[error("deployment method {0:?} is not supported")]
    Unsupported(DeploymentMethod),

    /// The deployment descriptor lacks a required setting.
    #[error("missing deployment setting '{0}'")]
    MissingSetting(&'static str),

    /// Provider CLI failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Provider answered with something unexpected.
    #[error("unexpected provider response: {0}")]
    Response(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CloudError {
    fn from(e: serde_json::Error) -> Self {
        Self::Response(e.to_string())
    }
}

/// Parsed deployment descriptor of an agents group.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub method: DeploymentMethod,
    /// Method-specific settings section.
    pub settings: Map<String, Value>,
}

impl Deployment {
    /// Parse a group's descriptor. `None` for static groups.
    pub fn of_group(group: &AgentsGroupRecord) -> Option<Self> {
        Self::parse(group.deployment.as_ref()?)
    }

    pub fn parse(value: &Value) -> Option<Self> {
        let method: DeploymentMethod =
            serde_json::from_value(value.get("method")?.clone()).ok()?;
        if !method.is_cloud() {
            return None;
        }
        let section = match method {
            DeploymentMethod::AwsEc2 => "aws",
            DeploymentMethod::AwsEcsFargate => "aws_ecs_fargate",
            DeploymentMethod::AzureVm => "azure_vm",
            DeploymentMethod::Kubernetes => "kubernetes",
            DeploymentMethod::Manual => return None,
        };
        let settings = value
            .get(section)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(Self { method, settings })
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn require(&self, key: &'static str) -> Result<&str, CloudError> {
        self.str(key).ok_or(CloudError::MissingSetting(key))
    }

    pub fn int(&self, key: &str) -> i64 {
        match self.settings.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn bool(&self, key: &str) -> bool {
        self.settings
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Upper bound of machines in the group; 0 means the default of 5.
    pub fn instances_limit(&self) -> i64 {
        match self.int("instances_limit") {
            n if n > 0 => n,
            _ => 5,
        }
    }

    /// Destroy an idle machine after this many completed jobs (0 = never).
    pub fn destruction_after_jobs(&self) -> i64 {
        if self.method.is_single_job() {
            return 1;
        }
        self.int("destruction_after_jobs").max(0)
    }

    /// Destroy an idle machine after this many idle minutes (0 = never).
    pub fn destruction_after_time(&self) -> i64 {
        self.int("destruction_after_time").max(0)
    }
}

/// Request to create machines for one system of a group.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub agents_group_id: i64,
    pub agents_group_name: String,
    pub system: SystemRecord,
    pub count: usize,
    pub server_url: String,
    pub clickhouse_addr: Option<String>,
}

impl MachineSpec {
    /// System id a VM agent serves: the system itself for local execution,
    /// any system (0) when jobs run in containers on the VM.
    pub fn vm_system_id(&self) -> i64 {
        if self.system.executor == "local" {
            self.system.id
        } else {
            0
        }
    }

    /// User-data script of a VM, with an optional extra tail.
    pub fn vm_init_script(&self, extra: Option<&str>) -> String {
        bootstrap_script(
            &self.server_url,
            self.clickhouse_addr.as_deref(),
            self.vm_system_id(),
            extra,
        )
    }

    /// Shell command of a single-job container that runs the agent once.
    pub fn container_command(&self) -> String {
        let url = self.server_url.trim_end_matches('/');
        let mut cmd = format!(
            "apt-get update && apt-get install -y --no-install-recommends ca-certificates sudo wget python3 \
             && mkdir -p /opt/kraken \
             && wget -O /opt/kraken/kkagent {url}/install/agent \
             && wget -O /opt/kraken/kktool {url}/install/tool \
             && chmod a+x /opt/kraken/kkagent /opt/kraken/kktool \
             && mkdir -p /tmp/kk-jobs \
             && /opt/kraken/kkagent run -d /tmp/kk-jobs -s {url}"
        );
        if let Some(addr) = &self.clickhouse_addr {
            cmd.push_str(&format!(" -c {}", addr));
        }
        cmd.push_str(&format!(" --system-id {} --one-job", self.system.id));
        cmd
    }
}

/// A machine created by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub machine_id: String,
    pub name: String,
    /// Address the agent will report from (private IP).
    pub address: String,
    pub ip_address: Option<String>,
    /// Provider-specific bookkeeping merged into `extra_attrs`.
    pub extra: Map<String, Value>,
}

/// A machine as listed by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMachine {
    pub machine_id: String,
    pub created: Option<DateTime<Utc>>,
    pub terminated: bool,
}

/// Provisioning backend of one deployment method.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn method(&self) -> DeploymentMethod;

    /// Create `spec.count` machines and wait until they have addresses.
    async fn create_machines(
        &self,
        deployment: &Deployment,
        spec: &MachineSpec,
    ) -> Result<Vec<Machine>, CloudError>;

    /// Terminate a machine. Terminating a missing machine succeeds.
    async fn destroy_machine(
        &self,
        deployment: &Deployment,
        machine_id: &str,
    ) -> Result<(), CloudError>;

    /// Whether the machine still exists and is not terminated.
    async fn machine_exists(
        &self,
        deployment: &Deployment,
        machine_id: &str,
    ) -> Result<bool, CloudError>;

    /// Machines tagged with the group id.
    async fn list_machines(
        &self,
        deployment: &Deployment,
        agents_group_id: i64,
    ) -> Result<Vec<RemoteMachine>, CloudError>;
}

/// Providers by deployment method.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<DeploymentMethod, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the CLI-backed providers of every method.
    pub fn with_cli_providers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(aws_ec2::AwsEc2Provider::new()));
        registry.register(Arc::new(aws_fargate::AwsFargateProvider::new()));
        registry.register(Arc::new(azure::AzureVmProvider::new()));
        registry.register(Arc::new(k8s::KubernetesProvider::new()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn get(&self, method: DeploymentMethod) -> Result<Arc<dyn CloudProvider>, CloudError> {
        self.providers
            .get(&method)
            .cloned()
            .ok_or(CloudError::Unsupported(method))
    }
}

/// Machine id recorded on a cloud agent.
pub fn agent_machine_id(agent: &AgentRecord) -> Option<&str> {
    agent.extra_attrs.get("machine_id").and_then(Value::as_str)
}

/// Agents group recorded on a cloud agent.
pub fn agent_group_id(agent: &AgentRecord) -> Option<i64> {
    agent.extra_attrs.get("group_id").and_then(Value::as_i64)
}

/// Whether the agent was created by the fleet manager.
pub fn is_cloud_agent(agent: &AgentRecord) -> bool {
    agent_machine_id(agent).is_some()
}

/// Bootstrap script run on a fresh machine.
///
/// `system_id` is the system the agent serves; for non-local executors the
/// machine serves any system and 0 is passed.
pub fn bootstrap_script(
    server_url: &str,
    clickhouse_addr: Option<&str>,
    system_id: i64,
    extra: Option<&str>,
) -> String {
    let mut install = format!("./agent install -s {}", server_url);
    if let Some(addr) = clickhouse_addr {
        install.push_str(&format!(" -c {}", addr));
    }
    install.push_str(&format!(" --system-id {}", system_id));

    let mut script = format!(
        "#!/usr/bin/env bash\n\
         exec > >(tee /var/log/user-data.log|logger -t user-data -s 2>/dev/console) 2>&1\n\
         wget -O agent {}/install/agent\n\
         chmod a+x agent\n\
         {}\n",
        server_url.trim_end_matches('/'),
        install
    );
    if let Some(extra) = extra.filter(|s| !s.trim().is_empty()) {
        script.push_str(extra);
        script.push('\n');
    }
    script
}

/// Short random suffix for machine names.
pub(crate) fn name_suffix() -> String {
    use rand::Rng;
    format!("{:08x}", rand::thread_rng().r#gen::<u32>())
}
