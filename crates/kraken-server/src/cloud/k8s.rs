// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes pods via `kubectl`. Each pod runs the agent for one job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kraken_core::model::DeploymentMethod;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{
    CloudError, CloudProvider, Deployment, Machine, MachineSpec, RemoteMachine, name_suffix,
};
use crate::process;

const GROUP_LABEL: &str = "kraken-group";

#[derive(Debug, Default)]
pub struct KubernetesProvider;

impl KubernetesProvider {
    pub fn new() -> Self {
        Self
    }

    async fn kubectl(
        &self,
        deployment: &Deployment,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<String, CloudError> {
        let mut full = vec![
            "--namespace".to_string(),
            deployment.str("namespace").unwrap_or("default").to_string(),
        ];
        if let Some(ctx) = deployment.str("context") {
            full.push("--context".to_string());
            full.push(ctx.to_string());
        }
        full.extend(args);
        Ok(process::run("kubectl", &full, None, stdin).await?)
    }
}

/// Pod manifest of one single-job agent.
pub fn pod_manifest(name: &str, spec: &MachineSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "labels": {
                GROUP_LABEL: spec.agents_group_id.to_string(),
                "kraken-system": spec.system.id.to_string(),
            }
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": "kraken-agent",
                "image": spec.system.name,
                "command": ["bash", "-c", spec.container_command()],
                "env": [
                    {"name": "LC_ALL", "value": "C.UTF-8"},
                    {"name": "LANG", "value": "C.UTF-8"}
                ]
            }]
        }
    })
}

fn pod_finished(pod: &Value) -> bool {
    matches!(
        pod.pointer("/status/phase").and_then(Value::as_str),
        Some("Succeeded" | "Failed")
    )
}

#[async_trait]
impl CloudProvider for KubernetesProvider {
    fn method(&self) -> DeploymentMethod {
        DeploymentMethod::Kubernetes
    }

    async fn create_machines(
        &self,
        deployment: &Deployment,
        spec: &MachineSpec,
    ) -> Result<Vec<Machine>, CloudError> {
        let namespace = deployment.str("namespace").unwrap_or("default").to_string();
        let mut machines = Vec::with_capacity(spec.count);
        for _ in 0..spec.count {
            let name = format!("kk-{}-{}-{}", spec.agents_group_id, spec.system.id, name_suffix());
            let manifest = pod_manifest(&name, spec).to_string();
            self.kubectl(
                deployment,
                vec!["apply".into(), "-f".into(), "-".into()],
                Some(manifest.as_bytes()),
            )
            .await?;
            self.kubectl(
                deployment,
                vec![
                    "wait".into(),
                    "--for=condition=Ready".into(),
                    format!("pod/{}", name),
                    "--timeout=300s".into(),
                ],
                None,
            )
            .await?;
            let out = self
                .kubectl(
                    deployment,
                    vec!["get".into(), "pod".into(), name.clone(), "-o".into(), "json".into()],
                    None,
                )
                .await?;
            let pod: Value = serde_json::from_str(&out)?;
            let Some(address) = pod.pointer("/status/podIP").and_then(Value::as_str) else {
                return Err(CloudError::Response(format!("pod {} has no IP", name)));
            };
            info!(group = %spec.agents_group_name, pod = %name, "Started agent pod");
            let mut extra = Map::new();
            extra.insert("pod".into(), Value::from(name.clone()));
            extra.insert("namespace".into(), Value::from(namespace.clone()));
            machines.push(Machine {
                machine_id: name.clone(),
                name,
                address: address.to_string(),
                ip_address: pod
                    .pointer("/status/hostIP")
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
        self.kubectl(
            deployment,
            vec![
                "delete".into(),
                "pod".into(),
                machine_id.to_string(),
                "--ignore-not-found".into(),
                "--wait=false".into(),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn machine_exists(
        &self,
        deployment: &Deployment,
        machine_id: &str,
    ) -> Result<bool, CloudError> {
        let out = self
            .kubectl(
                deployment,
                vec![
                    "get".into(),
                    "pod".into(),
                    machine_id.to_string(),
                    "--ignore-not-found".into(),
                    "-o".into(),
                    "json".into(),
                ],
                None,
            )
            .await?;
        if out.trim().is_empty() {
            return Ok(false);
        }
        let pod: Value = serde_json::from_str(&out)?;
        Ok(!pod_finished(&pod))
    }

    async fn list_machines(
        &self,
        deployment: &Deployment,
        agents_group_id: i64,
    ) -> Result<Vec<RemoteMachine>, CloudError> {
        let out = self
            .kubectl(
                deployment,
                vec![
                    "get".into(),
                    "pods".into(),
                    "-l".into(),
                    format!("{}={}", GROUP_LABEL, agents_group_id),
                    "-o".into(),
                    "json".into(),
                ],
                None,
            )
            .await?;
        let list: Value = serde_json::from_str(&out)?;
        Ok(list
            .get("items")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|pod| {
                Some(RemoteMachine {
                    machine_id: pod.pointer("/metadata/name")?.as_str()?.to_string(),
                    created: pod
                        .pointer("/metadata/creationTimestamp")
                        .and_then(Value::as_str)
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    terminated: pod_finished(pod),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kraken_core::persistence::SystemRecord;

    #[test]
    fn test_pod_manifest_labels_group() {
        let spec = MachineSpec {
            agents_group_id: 4,
            agents_group_name: "k8s".into(),
            system: SystemRecord {
                id: 2,
                name: "ubuntu:22.04".into(),
                executor: "local".into(),
            },
            count: 1,
            server_url: "http://srv".into(),
            clickhouse_addr: Some("ch:9001".into()),
        };
        let pod = pod_manifest("kk-4-2-x", &spec);
        assert_eq!(pod["metadata"]["labels"]["kraken-group"], "4");
        assert_eq!(pod["spec"]["containers"][0]["image"], "ubuntu:22.04");
        let cmd = pod["spec"]["containers"][0]["command"][2].as_str().unwrap();
        assert!(cmd.ends_with("-c ch:9001 --system-id 2 --one-job"));
    }

    #[test]
    fn test_pod_finished() {
        assert!(pod_finished(&json!({"status": {"phase": "Succeeded"}})));
        assert!(!pod_finished(&json!({"status": {"phase": "Running"}})));
    }
}
