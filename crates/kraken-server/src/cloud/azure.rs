// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Azure virtual machines via the `az` CLI.
//!
//! VMs are created in the configured resource group with the tag
//! `kraken-group=<group id>`; the system name is the VM image.

use std::io::Write;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kraken_core::model::DeploymentMethod;
use serde_json::{Map, Value};
use tracing::info;

use super::{
    CloudError, CloudProvider, Deployment, Machine, MachineSpec, RemoteMachine, name_suffix,
};
use crate::process;

const GROUP_TAG: &str = "kraken-group";

#[derive(Debug, Default)]
pub struct AzureVmProvider;

impl AzureVmProvider {
    pub fn new() -> Self {
        Self
    }

    async fn az(&self, args: Vec<String>) -> Result<Value, CloudError> {
        let mut full = args;
        full.push("--output".to_string());
        full.push("json".to_string());
        let out = process::run("az", &full, None, None).await?;
        if out.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&out)?)
    }
}

fn is_missing(e: &CloudError) -> bool {
    match e {
        CloudError::Command(c) => {
            c.stderr().contains("ResourceNotFound") || c.stderr().contains("was not found")
        }
        _ => false,
    }
}

#[async_trait]
impl CloudProvider for AzureVmProvider {
    fn method(&self) -> DeploymentMethod {
        DeploymentMethod::AzureVm
    }

    async fn create_machines(
        &self,
        deployment: &Deployment,
        spec: &MachineSpec,
    ) -> Result<Vec<Machine>, CloudError> {
        let rg = deployment.require("resource_group")?.to_string();
        let size = deployment.str("vm_size").unwrap_or("Standard_B1s").to_string();

        let mut init = tempfile::NamedTempFile::new()?;
        init.write_all(
            spec.vm_init_script(deployment.str("init_script"))
                .as_bytes(),
        )?;
        let init_path = init.path().to_string_lossy().into_owned();

        let mut machines = Vec::with_capacity(spec.count);
        for _ in 0..spec.count {
            let name = format!("kraken-agent-{}-{}", spec.agents_group_id, name_suffix());
            let mut args = vec![
                "vm".to_string(),
                "create".to_string(),
                "--resource-group".to_string(),
                rg.clone(),
                "--name".to_string(),
                name.clone(),
                "--image".to_string(),
                spec.system.name.clone(),
                "--size".to_string(),
                size.clone(),
                "--admin-username".to_string(),
                "kraken".to_string(),
                "--generate-ssh-keys".to_string(),
                "--custom-data".to_string(),
                init_path.clone(),
                "--tags".to_string(),
                format!("{}={}", GROUP_TAG, spec.agents_group_id),
            ];
            if let Some(location) = deployment.str("location") {
                args.push("--location".to_string());
                args.push(location.to_string());
            }
            let rsp = self.az(args).await?;
            let Some(address) = rsp.get("privateIpAddress").and_then(Value::as_str) else {
                return Err(CloudError::Response(format!("vm {} has no private address", name)));
            };
            info!(group = %spec.agents_group_name, vm = %name, "Spawned Azure VM");
            let mut extra = Map::new();
            extra.insert("instance_id".into(), Value::from(name.clone()));
            extra.insert("resource_group".into(), Value::from(rg.clone()));
            machines.push(Machine {
                machine_id: name.clone(),
                name,
                address: address.to_string(),
                ip_address: rsp
                    .get("publicIpAddress")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                extra,
            });
        }
        Ok(machines)
    }

    async fn destroy_machine(
        &self,
        deployment: &Deployment,
        machine_id: &str,
    ) -> Result<(), CloudError> {
        let args = vec![
            "vm".to_string(),
            "delete".to_string(),
            "--resource-group".to_string(),
            deployment.require("resource_group")?.to_string(),
            "--name".to_string(),
            machine_id.to_string(),
            "--yes".to_string(),
        ];
        match self.az(args).await {
            Err(e) if is_missing(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn machine_exists(
        &self,
        deployment: &Deployment,
        machine_id: &str,
    ) -> Result<bool, CloudError> {
        let args = vec![
            "vm".to_string(),
            "show".to_string(),
            "--resource-group".to_string(),
            deployment.require("resource_group")?.to_string(),
            "--name".to_string(),
            machine_id.to_string(),
        ];
        match self.az(args).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_machines(
        &self,
        deployment: &Deployment,
        agents_group_id: i64,
    ) -> Result<Vec<RemoteMachine>, CloudError> {
        let args = vec![
            "vm".to_string(),
            "list".to_string(),
            "--resource-group".to_string(),
            deployment.require("resource_group")?.to_string(),
        ];
        let rsp = self.az(args).await?;
        let group = agents_group_id.to_string();
        Ok(rsp
            .as_array()
            .into_iter()
            .flatten()
            .filter(|vm| {
                vm.pointer(&format!("/tags/{}", GROUP_TAG))
                    .and_then(Value::as_str)
                    == Some(group.as_str())
            })
            .filter_map(|vm| {
                Some(RemoteMachine {
                    machine_id: vm.get("name")?.as_str()?.to_string(),
                    created: vm
                        .get("timeCreated")
                        .and_then(Value::as_str)
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    terminated: vm
                        .get("provisioningState")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s == "Deleting"),
                })
            })
            .collect())
    }
}
