// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS ECS Fargate tasks via the `aws` CLI. Each task runs one job.
//!
//! Tasks are started with `--started-by kraken-group-<id>` which is how the
//! group's tasks are listed back.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use kraken_core::model::DeploymentMethod;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{CloudError, CloudProvider, Deployment, Machine, MachineSpec, RemoteMachine};
use crate::process;

const DEFAULT_TASK_DEFINITION: &str = "kraken-agent";
const CONTAINER_NAME: &str = "kraken-agent";

#[derive(Debug, Default)]
pub struct AwsFargateProvider;

impl AwsFargateProvider {
    pub fn new() -> Self {
        Self
    }

    async fn ecs(&self, deployment: &Deployment, args: Vec<String>) -> Result<Value, CloudError> {
        let mut full = vec![
            "--region".to_string(),
            deployment.require("region")?.to_string(),
            "--output".to_string(),
            "json".to_string(),
            "ecs".to_string(),
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
        arns: &[String],
    ) -> Result<Vec<Value>, CloudError> {
        if arns.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec![
            "describe-tasks".to_string(),
            "--cluster".to_string(),
            deployment.require("cluster")?.to_string(),
            "--tasks".to_string(),
        ];
        args.extend(arns.iter().cloned());
        let rsp = self.ecs(deployment, args).await?;
        Ok(rsp
            .get("tasks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

fn started_by(group_id: i64) -> String {
    format!("kraken-group-{}", group_id)
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Private IPv4 of the task's ENI attachment.
fn task_private_ip(task: &Value) -> Option<String> {
    task.get("attachments")?
        .as_array()?
        .iter()
        .filter_map(|a| a.get("details").and_then(Value::as_array))
        .flatten()
        .find(|d| d.get("name").and_then(Value::as_str) == Some("privateIPv4Address"))
        .and_then(|d| d.get("value").and_then(Value::as_str))
        .map(str::to_string)
}

fn task_created(task: &Value) -> Option<DateTime<Utc>> {
    match task.get("createdAt")? {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs as i64, 0).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

fn task_stopped(task: &Value) -> bool {
    matches!(
        task.get("lastStatus").and_then(Value::as_str),
        Some("STOPPED" | "DEPROVISIONING" | "STOPPING")
    )
}

#[async_trait]
impl CloudProvider for AwsFargateProvider {
    fn method(&self) -> DeploymentMethod {
        DeploymentMethod::AwsEcsFargate
    }

    async fn create_machines(
        &self,
        deployment: &Deployment,
        spec: &MachineSpec,
    ) -> Result<Vec<Machine>, CloudError> {
        let cluster = deployment.require("cluster")?.to_string();
        let network = json!({
            "awsvpcConfiguration": {
                "subnets": split_list(deployment.require("subnets")?),
                "securityGroups": split_list(deployment.require("security_groups")?),
                "assignPublicIp": "ENABLED"
            }
        });
        let mut env = vec![json!({"name": "KRAKEN_SERVER_ADDR", "value": spec.server_url})];
        if let Some(addr) = &spec.clickhouse_addr {
            env.push(json!({"name": "KRAKEN_CLICKHOUSE_ADDR", "value": addr}));
        }
        let overrides = json!({
            "containerOverrides": [{
                "name": CONTAINER_NAME,
                "command": ["bash", "-c", spec.container_command()],
                "environment": env,
            }]
        });
        let args = vec![
            "run-task".to_string(),
            "--cluster".to_string(),
            cluster.clone(),
            "--launch-type".to_string(),
            "FARGATE".to_string(),
            "--task-definition".to_string(),
            deployment
                .str("task_definition")
                .unwrap_or(DEFAULT_TASK_DEFINITION)
                .to_string(),
            "--count".to_string(),
            spec.count.to_string(),
            "--started-by".to_string(),
            started_by(spec.agents_group_id),
            "--network-configuration".to_string(),
            network.to_string(),
            "--overrides".to_string(),
            overrides.to_string(),
        ];
        let rsp = self.ecs(deployment, args).await?;
        let arns: Vec<String> = rsp
            .get("tasks")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|t| t.get("taskArn").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if arns.is_empty() {
            return Err(CloudError::Response(format!("run-task started no tasks: {}", rsp)));
        }
        info!(group = %spec.agents_group_name, tasks = ?arns, "Started Fargate tasks");

        let mut wait = vec![
            "wait".to_string(),
            "tasks-running".to_string(),
            "--cluster".to_string(),
            cluster,
            "--tasks".to_string(),
        ];
        wait.extend(arns.iter().cloned());
        self.ecs(deployment, wait).await?;

        let mut machines = Vec::new();
        for task in self.describe(deployment, &arns).await? {
            let (Some(arn), Some(address)) = (
                task.get("taskArn").and_then(Value::as_str),
                task_private_ip(&task),
            ) else {
                continue;
            };
            let short = arn.rsplit('/').next().unwrap_or(arn);
            let mut extra = Map::new();
            extra.insert("task_arn".into(), Value::from(arn));
            machines.push(Machine {
                machine_id: arn.to_string(),
                name: format!("fargate-{}", short),
                address,
                ip_address: None,
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
            "stop-task".to_string(),
            "--cluster".to_string(),
            deployment.require("cluster")?.to_string(),
            "--task".to_string(),
            machine_id.to_string(),
        ];
        match self.ecs(deployment, args).await {
            Ok(_) => Ok(()),
            Err(CloudError::Command(e)) if e.stderr().contains("InvalidParameterException") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn machine_exists(
        &self,
        deployment: &Deployment,
        machine_id: &str,
    ) -> Result<bool, CloudError> {
        let tasks = self.describe(deployment, &[machine_id.to_string()]).await?;
        Ok(tasks.iter().any(|t| !task_stopped(t)))
    }

    async fn list_machines(
        &self,
        deployment: &Deployment,
        agents_group_id: i64,
    ) -> Result<Vec<RemoteMachine>, CloudError> {
        let args = vec![
            "list-tasks".to_string(),
            "--cluster".to_string(),
            deployment.require("cluster")?.to_string(),
            "--started-by".to_string(),
            started_by(agents_group_id),
        ];
        let rsp = self.ecs(deployment, args).await?;
        let arns: Vec<String> = rsp
            .get("taskArns")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        Ok(self
            .describe(deployment, &arns)
            .await?
            .iter()
            .filter_map(|t| {
                Some(RemoteMachine {
                    machine_id: t.get("taskArn")?.as_str()?.to_string(),
                    created: task_created(t),
                    terminated: task_stopped(t),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_private_ip() {
        let task = json!({
            "taskArn": "arn:aws:ecs:r:1:task/c/abc",
            "attachments": [{"details": [
                {"name": "subnetId", "value": "subnet-1"},
                {"name": "privateIPv4Address", "value": "172.31.0.5"}
            ]}],
            "createdAt": 1700000000.5,
            "lastStatus": "RUNNING"
        });
        assert_eq!(task_private_ip(&task).as_deref(), Some("172.31.0.5"));
        assert_eq!(task_created(&task).unwrap().timestamp(), 1_700_000_000);
        assert!(!task_stopped(&task));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,,c"), vec!["a", "b", "c"]);
    }
}
