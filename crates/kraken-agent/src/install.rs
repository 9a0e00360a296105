// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Installation as a systemd service.

use std::path::{Path, PathBuf};

use nix::unistd::Uid;
use tracing::{info, warn};

use crate::config::{AgentConfig, ensure_dir, join_tools_dirs};
use crate::error::{Error, Result};
use crate::exec::cli::{self, DEFAULT_TIMEOUT};
use crate::host;
use crate::tools::{self, KKTOOL};

/// Home of the installed agent.
pub const AGENT_DIR: &str = "/opt/kraken";

pub const SERVICE_NAME: &str = "kraken-agent.service";

const SERVICE_USER: &str = "kraken";

/// Where and how the service gets installed.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub server: String,
    pub data_dir: PathBuf,
    pub tools_dirs: Vec<PathBuf>,
    pub clickhouse_addr: Option<String>,
    pub system_id: Option<String>,
    pub agent_dir: PathBuf,
    pub unit_dir: PathBuf,
}

impl InstallOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            server: config.server.clone(),
            data_dir: config.data_dir.clone(),
            tools_dirs: config.tools_dirs.clone(),
            clickhouse_addr: config.clickhouse_addr.clone(),
            system_id: config.system_id.clone(),
            agent_dir: PathBuf::from(AGENT_DIR),
            unit_dir: PathBuf::from("/lib/systemd/system"),
        }
    }

    pub fn agent_binary(&self) -> PathBuf {
        self.agent_dir.join("kraken-agent")
    }

    pub fn env_file(&self) -> PathBuf {
        self.agent_dir.join("kraken.env")
    }

    pub fn unit_file(&self) -> PathBuf {
        self.unit_dir.join(SERVICE_NAME)
    }
}

pub fn render_unit(opts: &InstallOptions) -> String {
    format!(
        "[Unit]\n\
         Description=Kraken Agent\n\
         Wants=network-online.target\n\
         After=network-online.target\n\
         After=time-sync.target\n\
         \n\
         [Service]\n\
         User={user}\n\
         ExecStart={bin} run -s {server} -d {data_dir}\n\
         Restart=on-failure\n\
         RestartSec=5s\n\
         EnvironmentFile={env}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        user = SERVICE_USER,
        bin = opts.agent_binary().display(),
        server = opts.server,
        data_dir = opts.data_dir.display(),
        env = opts.env_file().display(),
    )
}

pub fn render_env(opts: &InstallOptions) -> String {
    let mut env = String::from("# address of clickhouse-proxy, used for sending logs there\n");
    env.push_str(&format!(
        "KRAKEN_CLICKHOUSE_ADDR={}\n",
        opts.clickhouse_addr.as_deref().unwrap_or("")
    ));
    if !opts.tools_dirs.is_empty() {
        env.push_str(&format!("KRAKEN_TOOLS_DIRS={}\n", join_tools_dirs(&opts.tools_dirs)));
    }
    if let Some(system_id) = opts.system_id.as_deref().filter(|s| !s.is_empty()) {
        env.push_str(&format!("KRAKEN_SYSTEM_ID={}\n", system_id));
    }
    env
}

/// Write the env file and the unit file.
pub async fn write_files(opts: &InstallOptions) -> Result<()> {
    ensure_dir(&opts.agent_dir)?;
    ensure_dir(&opts.unit_dir)?;
    tokio::fs::write(opts.env_file(), render_env(opts)).await?;
    tokio::fs::write(opts.unit_file(), render_unit(opts)).await?;
    info!(unit = %opts.unit_file().display(), env = %opts.env_file().display(), "Service files written");
    Ok(())
}

/// Install the running binary as a service and start it. Needs root.
pub async fn install(mut opts: InstallOptions) -> Result<()> {
    if !Uid::effective().is_root() {
        return Err(Error::Config("install must be run as root".into()));
    }
    if std::env::consts::OS != "linux" {
        return Err(Error::Config(format!(
            "system {} is not supported yet",
            std::env::consts::OS
        )));
    }

    let os = tokio::fs::read_to_string("/etc/os-release")
        .await
        .map(|t| host::parse_os_release(&t))
        .unwrap_or_default();
    if os.id.contains("suse") {
        opts.unit_dir = PathBuf::from("/usr/lib/systemd/system");
    }
    ensure_user(&os.id).await?;

    ensure_dir(&opts.agent_dir)?;
    ensure_dir(&opts.data_dir)?;
    let exe = std::env::current_exe()?;
    copy_binary(&exe, &opts.agent_binary()).await?;
    let kktool = exe
        .parent()
        .map(|dir| dir.join(KKTOOL))
        .filter(|p| p.is_file())
        .or_else(|| tools::find_in_path(KKTOOL));
    match kktool {
        Some(kktool) => copy_binary(&kktool, &opts.agent_dir.join(KKTOOL)).await?,
        None => warn!("{} not found, containers will not get a step runner", KKTOOL),
    }

    write_files(&opts).await?;
    let owner = format!("{0}:{0}", SERVICE_USER);
    let agent_dir = opts.agent_dir.display().to_string();
    cli::run("chown", &["-R", &owner, &agent_dir], DEFAULT_TIMEOUT).await?;
    let data_dir = opts.data_dir.display().to_string();
    cli::run("chown", &["-R", &owner, &data_dir], DEFAULT_TIMEOUT).await?;

    for args in [
        &["daemon-reload"][..],
        &["enable", SERVICE_NAME][..],
        &["start", SERVICE_NAME][..],
    ] {
        cli::run("systemctl", args, DEFAULT_TIMEOUT).await?;
    }
    info!(service = SERVICE_NAME, server = %opts.server, "Kraken Agent installed and started");
    Ok(())
}

async fn ensure_user(distro: &str) -> Result<()> {
    if cli::probe("id", &[SERVICE_USER]).await {
        return Ok(());
    }
    let group = match distro {
        "ubuntu" | "debian" => "sudo",
        "fedora" | "centos" | "rhel" | "rocky" | "almalinux" => "wheel",
        d if d.contains("suse") => "wheel",
        other => {
            return Err(Error::Config(format!("distro {} is not supported yet", other)));
        }
    };
    info!(user = SERVICE_USER, group, "Creating service user");
    cli::run(
        "useradd",
        &[SERVICE_USER, "-d", AGENT_DIR, "-m", "-s", "/bin/bash", "-G", group, "--system"],
        DEFAULT_TIMEOUT,
    )
    .await?;
    Ok(())
}

async fn copy_binary(from: &Path, to: &Path) -> Result<()> {
    if from == to {
        return Ok(());
    }
    // a running binary cannot be overwritten in place
    let staged = to.with_extension("new");
    tokio::fs::copy(from, &staged).await?;
    tokio::fs::rename(&staged, to).await?;
    info!(from = %from.display(), to = %to.display(), "Binary installed");
    Ok(())
}
