// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes execution: one pod per job, driven through `kubectl`.
//!
//! Step files are copied into the pod before each command; tools connect
//! back to the agent on the host address.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kraken_protocol::JobDescriptor;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{info, warn};

use super::cli::{self, DEFAULT_TIMEOUT, shell_quote};
use super::{
    CancelToken, ExecContext, RunOutcome, ToolRun, container_name, guarded_start, provision_script,
    run_process,
};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::host;
use crate::logship::StepLog;
use crate::tools::{self, KKTOOL};

/// Namespace used when `KRAKEN_K8S_NAMESPACE` is not set.
pub const DEFAULT_NAMESPACE: &str = "kraken";

pub struct K8sContext {
    namespace: String,
    pod: String,
    image: String,
    job_id: i64,
    job_dir: PathBuf,
    kktool: Option<PathBuf>,
    agent_ip: IpAddr,
}

impl K8sContext {
    pub fn new(job: &JobDescriptor, config: &AgentConfig, agent_ip: IpAddr) -> Self {
        Self {
            namespace: std::env::var("KRAKEN_K8S_NAMESPACE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            pod: container_name(job.id),
            image: job.system.clone(),
            job_id: job.id,
            job_dir: config.job_dir(job.id),
            kktool: tools::find_kktool(config),
            agent_ip,
        }
    }

    pub async fn available() -> bool {
        cli::probe("kubectl", &["auth", "can-i", "create", "pods"]).await
    }

    /// Pod manifest keeping the container alive for the whole job.
    pub fn manifest(&self, timeout: Duration) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.pod,
                "namespace": self.namespace,
                "labels": {"app": "kraken-job", "kraken-job": self.job_id.to_string()}
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [{
                    "name": "job",
                    "image": self.image,
                    "command": ["sleep", (timeout.as_secs() + 60).to_string()]
                }]
            }
        })
    }

    async fn kubectl(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let mut full = vec!["-n", self.namespace.as_str()];
        full.extend_from_slice(args);
        cli::run("kubectl", &full, timeout).await
    }

    async fn exec_root(&self, script: &str, timeout: Duration) -> Result<String> {
        self.kubectl(&["exec", &self.pod, "--", "sh", "-c", script], timeout)
            .await
    }

    fn pod_path(&self, path: &str) -> String {
        format!("{}/{}:{}", self.namespace, self.pod, path)
    }

    async fn prepare(&self, timeout: Duration) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::Exec("job has no system image for kubernetes".into()));
        }
        let kktool = self
            .kktool
            .as_ref()
            .ok_or_else(|| Error::Exec(format!("{} not found on agent host", KKTOOL)))?;

        info!(namespace = %self.namespace, pod = %self.pod, image = %self.image, "Creating pod");
        let manifest = serde_json::to_vec(&self.manifest(timeout))?;
        cli::run_with_input("kubectl", &["apply", "-f", "-"], Some(&manifest), DEFAULT_TIMEOUT)
            .await?;

        let wait = format!("--timeout={}s", timeout.as_secs().max(1));
        let pod = format!("pod/{}", self.pod);
        self.kubectl(&["wait", "--for=condition=Ready", &pod, &wait], timeout)
            .await?;

        let bin = format!("/usr/local/bin/{}", KKTOOL);
        cli::run(
            "kubectl",
            &["cp", &kktool.display().to_string(), &self.pod_path(&bin)],
            DEFAULT_TIMEOUT,
        )
        .await?;
        let job_dir = shell_quote(&self.job_dir.display().to_string());
        self.exec_root(
            &format!("chmod 0755 {} && mkdir -p {} && chmod a+rwx {}", bin, job_dir, job_dir),
            DEFAULT_TIMEOUT,
        )
        .await?;

        let os_release = self.exec_root("cat /etc/os-release", DEFAULT_TIMEOUT).await?;
        let distro = host::parse_os_release(&os_release).id;
        match provision_script(&distro) {
            Some(script) => {
                info!(pod = %self.pod, distro = %distro, "Provisioning pod");
                self.exec_root(&script, timeout).await?;
            }
            None => warn!(distro = %distro, "Unknown distro, pod used as-is"),
        }
        info!(pod = %self.pod, "Pod ready");
        Ok(())
    }
}

#[async_trait]
impl ExecContext for K8sContext {
    fn kind(&self) -> &'static str {
        "k8s"
    }

    async fn start(&self, timeout: Duration) -> Result<()> {
        guarded_start(self, "pod", timeout, self.prepare(timeout)).await
    }

    fn return_ip(&self) -> IpAddr {
        self.agent_ip
    }

    async fn run(&self, run: &ToolRun, log: &StepLog, cancel: &CancelToken) -> Result<RunOutcome> {
        let step_file = run.step_file.display().to_string();
        cli::run(
            "kubectl",
            &["cp", &step_file, &self.pod_path(&step_file)],
            DEFAULT_TIMEOUT,
        )
        .await?;

        let mut line = format!("cd {} && exec", shell_quote(&run.cwd.display().to_string()));
        if let Some(user) = &run.user {
            line.push_str(&format!(" sudo -n -u {} --", shell_quote(user)));
        }
        line.push(' ');
        line.push_str(KKTOOL);
        for arg in run.args(&run.step_file) {
            line.push(' ');
            line.push_str(&shell_quote(&arg));
        }

        let mut cmd = Command::new("kubectl");
        cmd.args(["-n", self.namespace.as_str(), "exec", self.pod.as_str(), "--", "sh", "-c"])
            .arg(&line);
        info!(pod = %self.pod, command = %run.command, "Running tool in pod");
        run_process(cmd, log, run.timeout, cancel).await
    }

    async fn stop(&self) {
        let result = self
            .kubectl(
                &["delete", "pod", &self.pod, "--wait=false", "--ignore-not-found"],
                DEFAULT_TIMEOUT,
            )
            .await;
        if let Err(e) = result {
            warn!(pod = %self.pod, error = %e, "Cannot delete pod");
        }
    }
}
