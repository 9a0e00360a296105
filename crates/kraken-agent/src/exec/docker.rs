// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker execution: one container per job, driven through the `docker` CLI.
//!
//! The container is started from the job's system image on the shared
//! `kknet` network with the job directory bind-mounted at the same path, so
//! step files need no copying. When the agent itself runs in a container it
//! joins `kknet` too, together with the log-shipping proxy.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::OnceLock;
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

/// Network shared by job containers, the agent and the log proxy.
pub const NETWORK: &str = "kknet";

/// Return address when the agent runs on the docker host itself and the
/// network gateway cannot be read.
const DEFAULT_BRIDGE_GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 1);

/// Containers whose name contains this are attached to [`NETWORK`].
const LOG_PROXY_NAME: &str = "clickhouse-proxy";

const DEFAULT_USER: &str = "kraken";

pub struct DockerContext {
    image: String,
    container: String,
    job_dir: PathBuf,
    kktool: Option<PathBuf>,
    clickhouse_addr: Option<String>,
    return_ip: OnceLock<IpAddr>,
}

impl DockerContext {
    pub fn new(job: &JobDescriptor, config: &AgentConfig) -> Self {
        Self {
            image: job.system.clone(),
            container: container_name(job.id),
            job_dir: config.job_dir(job.id),
            kktool: tools::find_kktool(config),
            clickhouse_addr: config.clickhouse_addr.clone(),
            return_ip: OnceLock::new(),
        }
    }

    pub async fn available() -> bool {
        cli::probe("docker", &["version", "--format", "{{.Server.Version}}"]).await
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        cli::run("docker", args, DEFAULT_TIMEOUT).await
    }

    async fn exec_root(&self, script: &str, timeout: Duration) -> Result<String> {
        cli::run(
            "docker",
            &["exec", "-u", "root", &self.container, "sh", "-c", script],
            timeout,
        )
        .await
    }

    async fn ensure_network(&self) -> Result<()> {
        if self.docker(&["network", "inspect", NETWORK]).await.is_ok() {
            return Ok(());
        }
        let swarm = self
            .docker(&["info", "--format", "{{.Swarm.LocalNodeState}}"])
            .await
            .map(|s| s == "active")
            .unwrap_or(false);
        let driver = if swarm { "overlay" } else { "bridge" };
        info!(network = NETWORK, driver, "Creating docker network");
        self.docker(&["network", "create", "--attachable", "--driver", driver, NETWORK])
            .await?;
        Ok(())
    }

    /// Attach a container to [`NETWORK`] unless it already is.
    async fn connect(&self, container: &str) -> Result<()> {
        let networks = self
            .docker(&[
                "inspect",
                "--format",
                "{{range $k, $v := .NetworkSettings.Networks}}{{$k}} {{end}}",
                container,
            ])
            .await?;
        if networks.split_whitespace().any(|n| n == NETWORK) {
            return Ok(());
        }
        self.docker(&["network", "connect", NETWORK, container]).await?;
        Ok(())
    }

    async fn prepare(&self, timeout: Duration) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::Exec("job has no system image for docker".into()));
        }
        let kktool = self
            .kktool
            .as_ref()
            .ok_or_else(|| Error::Exec(format!("{} not found on agent host", KKTOOL)))?;

        self.ensure_network().await?;

        info!(image = %self.image, container = %self.container, "Starting container");
        let mount = format!("{0}:{0}", self.job_dir.display());
        let sleep = (timeout.as_secs() + 60).to_string();
        cli::run(
            "docker",
            &[
                "run", "-d", "--name", &self.container, "--network", NETWORK, "-v", &mount,
                &self.image, "sleep", &sleep,
            ],
            timeout,
        )
        .await?;

        let target = format!("{}:/usr/local/bin/{}", self.container, KKTOOL);
        self.docker(&["cp", &kktool.display().to_string(), &target]).await?;

        let os_release = self.exec_root("cat /etc/os-release", DEFAULT_TIMEOUT).await?;
        let distro = host::parse_os_release(&os_release).id;
        match provision_script(&distro) {
            Some(script) => {
                info!(container = %self.container, distro = %distro, "Provisioning container");
                self.exec_root(&script, timeout).await?;
            }
            None => warn!(distro = %distro, "Unknown distro, container used as-is"),
        }
        let job_dir = self.job_dir.display().to_string();
        self.exec_root(&format!("chmod a+rwx {}", cli::shell_quote(&job_dir)), DEFAULT_TIMEOUT)
            .await?;

        let ip = if host::in_docker() {
            let me = host::hostname();
            self.connect(&me).await?;
            self.attach_log_proxy().await;
            let template = format!(
                "{{{{(index .NetworkSettings.Networks \"{}\").IPAddress}}}}",
                NETWORK
            );
            self.docker(&["inspect", "--format", &template, &me]).await?
        } else {
            self.docker(&[
                "network",
                "inspect",
                "--format",
                "{{range .IPAM.Config}}{{.Gateway}}{{end}}",
                NETWORK,
            ])
            .await?
        };
        let ip = ip
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(DEFAULT_BRIDGE_GATEWAY));
        let _ = self.return_ip.set(ip);
        info!(container = %self.container, return_ip = %ip, "Container ready");
        Ok(())
    }

    async fn attach_log_proxy(&self) {
        let names = match self.docker(&["ps", "--format", "{{.Names}}"]).await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Cannot list containers");
                return;
            }
        };
        for name in names.lines().filter(|n| n.contains(LOG_PROXY_NAME)) {
            if let Err(e) = self.connect(name).await {
                warn!(container = %name, error = %e, "Cannot attach log proxy to network");
            }
        }
    }
}

#[async_trait]
impl ExecContext for DockerContext {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, timeout: Duration) -> Result<()> {
        guarded_start(self, "docker container", timeout, self.prepare(timeout)).await
    }

    fn return_ip(&self) -> IpAddr {
        self.return_ip
            .get()
            .copied()
            .unwrap_or(IpAddr::V4(DEFAULT_BRIDGE_GATEWAY))
    }

    async fn run(&self, run: &ToolRun, log: &StepLog, cancel: &CancelToken) -> Result<RunOutcome> {
        let user = run.user.as_deref().unwrap_or(DEFAULT_USER);
        let mut cmd = Command::new("docker");
        cmd.args(["exec", "-w"])
            .arg(&run.cwd)
            .args(["-u", user]);
        if let Some(addr) = &self.clickhouse_addr {
            cmd.arg("-e").arg(format!("KRAKEN_CLICKHOUSE_ADDR={}", addr));
        }
        cmd.arg(&self.container)
            .arg(KKTOOL)
            .args(run.args(&run.step_file));
        info!(container = %self.container, command = %run.command, "Running tool in container");

        let outcome = run_process(cmd, log, run.timeout, cancel).await?;
        if matches!(outcome, RunOutcome::TimedOut | RunOutcome::Cancelled) {
            // the docker client is gone, the tool inside may still run
            let _ = self
                .exec_root(&format!("pkill -TERM -f {}", KKTOOL), Duration::from_secs(10))
                .await;
        }
        Ok(outcome)
    }

    async fn stop(&self) {
        if let Err(e) = self.docker(&["rm", "-f", &self.container]).await {
            warn!(container = %self.container, error = %e, "Cannot remove container");
        }
    }
}
