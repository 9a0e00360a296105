// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution contexts.
//!
//! An execution context is the place where a job's tools run: the agent
//! host itself, a Docker container, an LXD container or a Kubernetes pod.
//! The job runner only talks to the [`ExecContext`] trait:
//!
//! 1. [`start`](ExecContext::start) prepares the environment (image pulled,
//!    kktool injected, network attached)
//! 2. [`return_ip`](ExecContext::return_ip) names the agent address tools
//!    can connect back to
//! 3. [`run`](ExecContext::run) executes one tool command and pumps its
//!    output into the step log
//! 4. [`stop`](ExecContext::stop) tears everything down
//!
//! Cloud machines run their own agent, which then uses the local context.

pub mod cli;
pub mod docker;
pub mod k8s;
pub mod local;
pub mod lxd;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kraken_protocol::{Capabilities, JobDescriptor, ToolCommand};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::logship::StepLog;
use crate::tools::ToolInvocation;

pub use docker::DockerContext;
pub use k8s::K8sContext;
pub use local::LocalContext;
pub use lxd::LxdContext;

/// Set to `true` to stop a running tool.
pub type CancelToken = Arc<AtomicBool>;

pub fn cancel_token() -> CancelToken {
    Arc::new(AtomicBool::new(false))
}

/// Time between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Output readers get this long to finish after the process is gone.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

/// How a tool process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    TimedOut,
    Cancelled,
}

/// One kktool invocation.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub tool: ToolInvocation,
    pub command: ToolCommand,
    /// Step file on the agent host.
    pub step_file: PathBuf,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Callback address, filled in by the coordinator.
    pub return_addr: SocketAddr,
    pub user: Option<String>,
}

impl ToolRun {
    pub fn new(
        tool: ToolInvocation,
        command: ToolCommand,
        step_file: impl Into<PathBuf>,
        cwd: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            tool,
            command,
            step_file: step_file.into(),
            cwd: cwd.into(),
            timeout,
            return_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            user: None,
        }
    }

    /// Arguments after the program name, with the step file as seen by the tool.
    pub fn args(&self, step_file: &Path) -> Vec<String> {
        self.tool
            .args(&self.return_addr, step_file, self.command)
    }
}

/// Backend running job tools.
#[async_trait]
pub trait ExecContext: Send + Sync {
    /// Executor name (`local`, `docker`, ...).
    fn kind(&self) -> &'static str;

    /// Prepare the environment within `timeout`.
    async fn start(&self, timeout: Duration) -> Result<()>;

    /// Address tools use to reach the agent's callback server.
    fn return_ip(&self) -> IpAddr;

    /// Whether tools run on the agent host, so host programs can be used directly.
    fn runs_on_host(&self) -> bool {
        false
    }

    /// Run one tool command to completion, timeout or cancellation.
    async fn run(&self, run: &ToolRun, log: &StepLog, cancel: &CancelToken) -> Result<RunOutcome>;

    /// Release everything `start` created. Errors are logged, not returned.
    async fn stop(&self);
}

/// Pick the backend for `job.executor`. Unknown executors run locally.
pub fn create_context(
    job: &JobDescriptor,
    config: &AgentConfig,
    agent_ip: IpAddr,
) -> Arc<dyn ExecContext> {
    match job.executor.as_str() {
        "docker" => Arc::new(DockerContext::new(job, config)),
        "lxd" => Arc::new(LxdContext::new(job, config, agent_ip)),
        "k8s" | "kubernetes" => Arc::new(K8sContext::new(job, config, agent_ip)),
        other => {
            if other != "local" {
                warn!(executor = %other, job_id = job.id, "Unknown executor, running locally");
            }
            Arc::new(LocalContext::new())
        }
    }
}

/// Probe which container backends are usable on this host.
pub async fn detect_capabilities() -> Capabilities {
    let (docker, lxd, k8s) = tokio::join!(
        DockerContext::available(),
        LxdContext::available(),
        K8sContext::available()
    );
    Capabilities { docker, lxd, k8s }
}

/// Name of the container or pod created for a job.
pub fn container_name(job_id: i64) -> String {
    format!("kk-job-{}", job_id)
}

/// Run `prepare` within `timeout`; on failure call `stop` so nothing
/// half-started is left behind.
pub(crate) async fn guarded_start<C, F>(ctx: &C, what: &str, timeout: Duration, prepare: F) -> Result<()>
where
    C: ExecContext + ?Sized,
    F: std::future::Future<Output = Result<()>>,
{
    let result = match tokio::time::timeout(timeout, prepare).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "starting {} took longer than {}s",
            what,
            timeout.as_secs()
        ))),
    };
    if let Err(e) = &result {
        warn!(executor = ctx.kind(), error = %e, "Execution context failed to start");
        ctx.stop().await;
    }
    result
}

/// Shell script installing what kktool needs, chosen by the distro `ID`
/// from `/etc/os-release`. `None` for distros that are used as-is.
pub fn provision_script(distro: &str) -> Option<String> {
    let script = match distro {
        "debian" | "ubuntu" => concat!(
            "export DEBIAN_FRONTEND=noninteractive; ",
            "apt-get update && ",
            "apt-get install -y --no-install-recommends python3 ca-certificates sudo git curl && ",
            "(getent passwd kraken || useradd kraken -d /opt/kraken -m -s /bin/bash -G sudo) && ",
            "echo 'kraken ALL=NOPASSWD: ALL' > /etc/sudoers.d/kraken"
        ),
        "centos" | "fedora" | "rhel" | "rocky" | "almalinux" => concat!(
            "yum install -y python3 ca-certificates sudo git curl && ",
            "(getent passwd kraken || useradd kraken -d /opt/kraken -m -s /bin/bash -G wheel --system) && ",
            "echo 'kraken ALL=NOPASSWD: ALL' > /etc/sudoers.d/kraken"
        ),
        _ => return None,
    };
    Some(script.to_string())
}

/// Spawn `cmd`, pump its stdout and stderr into `log` line by line and wait
/// for it under `timeout` and `cancel`.
pub async fn run_process(
    mut cmd: Command,
    log: &StepLog,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Exec(format!("cannot spawn {:?}: {}", cmd.as_std().get_program(), e)))?;

    let mut pumps = JoinSet::new();
    if let Some(out) = child.stdout.take() {
        pumps.spawn(pump(out, log.clone()));
    }
    if let Some(err) = child.stderr.take() {
        pumps.spawn(pump(err, log.clone()));
    }

    let outcome = wait_child(&mut child, timeout, cancel).await;

    let drained = tokio::time::timeout(PUMP_DRAIN, async {
        while pumps.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!("Output still open after process exit, detaching readers");
        pumps.abort_all();
    }
    outcome
}

async fn pump<R: AsyncRead + Unpin>(reader: R, log: StepLog) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => log.line(&String::from_utf8_lossy(&buf)).await,
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

/// Poll the child until it exits, the timeout passes or `cancel` is set.
pub async fn wait_child(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    let start = Instant::now();

    loop {
        if cancel.load(Ordering::Relaxed) {
            warn!(pid = ?child.id(), "Execution cancelled, terminating process");
            terminate(child).await;
            return Ok(RunOutcome::Cancelled);
        }

        if start.elapsed() > timeout {
            warn!(pid = ?child.id(), timeout_secs = timeout.as_secs(), "Execution timed out, terminating process");
            terminate(child).await;
            return Ok(RunOutcome::TimedOut);
        }

        match child.try_wait() {
            Ok(Some(status)) => return Ok(RunOutcome::Exited(exit_code(status))),
            Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// SIGTERM, then SIGKILL if the process outlives [`KILL_GRACE`].
pub async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => return,
        Err(e) => warn!(pid, error = %e, "SIGTERM failed"),
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!(pid, "Process ignored SIGTERM, killing");
        if let Err(e) = child.kill().await {
            warn!(pid, error = %e, "SIGKILL failed");
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
