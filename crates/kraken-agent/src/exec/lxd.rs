// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! LXD execution through the `lxc` CLI.
//!
//! The job directory is attached to the container as a disk device at the
//! same path. Tools reach the agent on the host's outward-facing address.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use kraken_protocol::JobDescriptor;
use tokio::process::Command;
use tracing::{info, warn};

use super::cli::{self, DEFAULT_TIMEOUT};
use super::{
    CancelToken, ExecContext, RunOutcome, ToolRun, container_name, guarded_start, provision_script,
    run_process,
};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::host;
use crate::logship::StepLog;
use crate::tools::{self, KKTOOL};

const NETWORK_POLL: Duration = Duration::from_secs(1);

pub struct LxdContext {
    image: String,
    container: String,
    job_dir: PathBuf,
    kktool: Option<PathBuf>,
    agent_ip: IpAddr,
}

impl LxdContext {
    pub fn new(job: &JobDescriptor, config: &AgentConfig, agent_ip: IpAddr) -> Self {
        Self {
            image: image_ref(&job.system),
            container: container_name(job.id),
            job_dir: config.job_dir(job.id),
            kktool: tools::find_kktool(config),
            agent_ip,
        }
    }

    pub async fn available() -> bool {
        cli::probe("lxc", &["info"]).await
    }

    async fn exec_root(&self, script: &str, timeout: Duration) -> Result<String> {
        cli::run(
            "lxc",
            &["exec", &self.container, "--", "sh", "-c", script],
            timeout,
        )
        .await
    }

    async fn prepare(&self, timeout: Duration) -> Result<()> {
        let kktool = self
            .kktool
            .as_ref()
            .ok_or_else(|| Error::Exec(format!("{} not found on agent host", KKTOOL)))?;

        info!(image = %self.image, container = %self.container, "Launching LXD container");
        cli::run("lxc", &["launch", &self.image, &self.container], timeout).await?;

        // wait for a default route, package installs need the network
        loop {
            if self
                .exec_root("ip route | grep -q default", DEFAULT_TIMEOUT)
                .await
                .is_ok()
            {
                break;
            }
            tokio::time::sleep(NETWORK_POLL).await;
        }

        let source = format!("source={}", self.job_dir.display());
        let path = format!("path={}", self.job_dir.display());
        cli::run(
            "lxc",
            &["config", "device", "add", &self.container, "jobdir", "disk", &source, &path],
            DEFAULT_TIMEOUT,
        )
        .await?;

        let target = format!("{}/usr/local/bin/{}", self.container, KKTOOL);
        cli::run(
            "lxc",
            &["file", "push", "--mode", "0755", &kktool.display().to_string(), &target],
            DEFAULT_TIMEOUT,
        )
        .await?;

        let os_release = self.exec_root("cat /etc/os-release", DEFAULT_TIMEOUT).await?;
        let distro = host::parse_os_release(&os_release).id;
        match provision_script(&distro) {
            Some(script) => {
                info!(container = %self.container, distro = %distro, "Provisioning container");
                self.exec_root(&script, timeout).await?;
            }
            None => warn!(distro = %distro, "Unknown distro, container used as-is"),
        }
        info!(container = %self.container, "LXD container ready");
        Ok(())
    }
}

/// `ubuntu-22.04` style names map to the `images:` remote, explicit
/// `remote:alias` references are kept.
fn image_ref(system: &str) -> String {
    if system.contains(':') {
        return system.to_string();
    }
    match system.split_once('-') {
        Some((distro, version)) => format!("images:{}/{}", distro, version),
        None => format!("images:{}", system),
    }
}

#[async_trait]
impl ExecContext for LxdContext {
    fn kind(&self) -> &'static str {
        "lxd"
    }

    async fn start(&self, timeout: Duration) -> Result<()> {
        guarded_start(self, "LXD container", timeout, self.prepare(timeout)).await
    }

    fn return_ip(&self) -> IpAddr {
        self.agent_ip
    }

    async fn run(&self, run: &ToolRun, log: &StepLog, cancel: &CancelToken) -> Result<RunOutcome> {
        let mut cmd = Command::new("lxc");
        cmd.args(["exec", self.container.as_str(), "--cwd"])
            .arg(&run.cwd)
            .arg("--");
        if let Some(user) = run.user.as_deref() {
            cmd.args(["sudo", "-n", "-u", user, "--"]);
        }
        cmd.arg(KKTOOL).args(run.args(&run.step_file));
        info!(container = %self.container, command = %run.command, "Running tool in LXD container");
        run_process(cmd, log, run.timeout, cancel).await
    }

    async fn stop(&self) {
        if let Err(e) = cli::run("lxc", &["delete", "--force", &self.container], DEFAULT_TIMEOUT).await {
            warn!(container = %self.container, error = %e, "Cannot delete LXD container");
        }
    }
}
