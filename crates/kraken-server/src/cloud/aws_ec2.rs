// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS EC2 virtual machines via the `aws` CLI.
//!
//! The system name of a job is the AMI id. Instances carry the tag
//! `kraken-group=<group id>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kraken_core::model::DeploymentMethod;
use serde_json::{Map, Value};
use tracing::info;

use super::{CloudError, CloudProvider, Deployment, Machine, MachineSpec, RemoteMachine};
use crate::process::{self, CommandError};

const GROUP_TAG: &str = "kraken-group";

#[derive(Debug, Default)]
pub struct AwsEc2Provider;

impl AwsEc2Provider {
    pub fn new() -> Self {
        Self
    }

    async fn aws(&self, deployment: &Deployment, args: Vec<String>) -> Result<Value, CloudError> {
        let mut full = vec![
            "--region".to_string(),
            deployment.require("region")?.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        full.extend(args);
        let out = process::run("aws", &full, None, None).await?;
        if out.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&out)?)
    }

    async fn describe(
        &self,
        deployment: &Deployment,
        filters: Vec<String>,
    ) -> Result<Vec<Value>, CloudError> {
        let mut args = vec!["ec2".to_string(), "describe-instances".to_string()];
        args.extend(filters);
        let rsp = self.aws(deployment, args).await?;
        Ok(instances(&rsp))
    }
}

fn s(v: &str) -> String {
    v.to_string()
}

/// Flatten `Reservations[].Instances[]`.
fn instances(rsp: &Value) -> Vec<Value> {
    rsp.get("Reservations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("Instances").and_then(Value::as_array))
        .flatten()
        .cloned()
        .collect()
}

fn instance_state(inst: &Value) -> &str {
    inst.pointer("/State/Name")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

fn is_gone(state: &str) -> bool {
    matches!(state, "shutting-down" | "terminated")
}

/// `ec2-1-2-3-4.eu-west-1.compute.amazonaws.com` → `ec2-1-2-3-4.eu-west-1`.
fn short_dns_name(dns: &str) -> String {
    dns.split('.').take(2).collect::<Vec<_>>().join(".")
}

#[async_trait]
impl CloudProvider for AwsEc2Provider {
    fn method(&self) -> DeploymentMethod {
        DeploymentMethod::AwsEc2
    }

    async fn create_machines(
        &self,
        deployment: &Deployment,
        spec: &MachineSpec,
    ) -> Result<Vec<Machine>, CloudError> {
        let instance_type = deployment.require("instance_type")?;
        let count = spec.count.to_string();
        let tags = format!(
            "ResourceType=instance,Tags=[{{Key={},Value={}}}]",
            GROUP_TAG, spec.agents_group_id
        );
        let mut args = vec![
            s("ec2"),
            s("run-instances"),
            s("--image-id"),
            spec.system.name.clone(),
            s("--count"),
            count,
            s("--instance-type"),
            s(instance_type),
            s("--tag-specifications"),
            tags,
            s("--user-data"),
            spec.vm_init_script(deployment.str("init_script")),
        ];
        if deployment.bool("spot_instance") {
            args.push(s("--instance-market-options"));
            args.push(s("MarketType=spot"));
        }
        if instance_type.starts_with("t2") || instance_type.starts_with("t3") {
            let credits = if deployment.bool("cpu_credits_unlimited") {
                "unlimited"
            } else {
                "standard"
            };
            args.push(s("--credit-specification"));
            args.push(format!("CpuCredits={}", credits));
        }
        let disk_size = deployment.int("disk_size");
        if disk_size > 0 {
            args.push(s("--block-device-mappings"));
            args.push(format!(
                "DeviceName=/dev/sda1,Ebs={{VolumeSize={}}}",
                disk_size
            ));
        }
        if let Some(key) = deployment.str("key_name") {
            args.push(s("--key-name"));
            args.push(s(key));
        }
        if let Some(sg) = deployment.str("security_group_id") {
            args.push(s("--security-group-ids"));
            args.push(s(sg));
        }

        let rsp = self.aws(deployment, args).await?;
        let ids: Vec<String> = rsp
            .get("Instances")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|i| i.get("InstanceId").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Err(CloudError::Response("run-instances returned no instances".into()));
        }
        info!(group = %spec.agents_group_name, instances = ?ids, "Spawning EC2 instances");

        let mut wait = vec![s("ec2"), s("wait"), s("instance-running"), s("--instance-ids")];
        wait.extend(ids.iter().cloned());
        self.aws(deployment, wait).await?;

        let mut filter = vec![s("--instance-ids")];
        filter.extend(ids.iter().cloned());
        let described = self.describe(deployment, filter).await?;

        let mut machines = Vec::new();
        for inst in described {
            let Some(id) = inst.get("InstanceId").and_then(Value::as_str) else {
                continue;
            };
            let Some(address) = inst.get("PrivateIpAddress").and_then(Value::as_str) else {
                continue;
            };
            let dns = inst
                .get("PublicDnsName")
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
                .map(short_dns_name)
                .unwrap_or_else(|| id.to_string());
            let mut extra = Map::new();
            extra.insert("instance_id".into(), Value::from(id));
            machines.push(Machine {
                machine_id: id.to_string(),
                name: dns,
                address: address.to_string(),
                ip_address: inst
                    .get("PublicIpAddress")
                    .and_then(Value::as_str)
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
            s("ec2"),
            s("terminate-instances"),
            s("--instance-ids"),
            s(machine_id),
        ];
        match self.aws(deployment, args).await {
            Ok(_) => Ok(()),
            Err(CloudError::Command(e)) if not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn machine_exists(
        &self,
        deployment: &Deployment,
        machine_id: &str,
    ) -> Result<bool, CloudError> {
        match self
            .describe(deployment, vec![s("--instance-ids"), s(machine_id)])
            .await
        {
            Ok(list) => Ok(list.iter().any(|i| !is_gone(instance_state(i)))),
            Err(CloudError::Command(e)) if not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_machines(
        &self,
        deployment: &Deployment,
        agents_group_id: i64,
    ) -> Result<Vec<RemoteMachine>, CloudError> {
        let filter = vec![
            s("--filters"),
            format!("Name=tag:{},Values={}", GROUP_TAG, agents_group_id),
        ];
        let list = self.describe(deployment, filter).await?;
        Ok(list
            .iter()
            .filter_map(|inst| {
                let id = inst.get("InstanceId")?.as_str()?;
                Some(RemoteMachine {
                    machine_id: id.to_string(),
                    created: inst
                        .get("LaunchTime")
                        .and_then(Value::as_str)
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    terminated: is_gone(instance_state(inst)),
                })
            })
            .collect())
    }
}

fn not_found(e: &CommandError) -> bool {
    e.stderr().contains("InvalidInstanceID.NotFound") || e.stderr().contains("InvalidInstanceID.Malformed")
}
