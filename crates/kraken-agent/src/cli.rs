// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{AgentConfig, DEFAULT_DATA_DIR, parse_tools_dirs};

#[derive(Parser, Debug)]
#[command(name = "kraken-agent")]
#[command(about = "Kraken CI agent", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the agent in the system as a systemd service
    Install(AgentArgs),

    /// Check if the current installation is complete and should work
    CheckIntegrity,

    /// Start the agent
    Run(AgentArgs),
}

/// Options shared by `install` and `run`.
#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    /// Server URL
    #[arg(short = 's', long, env = "KRAKEN_SERVER_ADDR")]
    pub server: String,

    /// Directory for persistent data
    #[arg(short = 'd', long, env = "KRAKEN_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// List of tools directories, separated by ':' or ','
    #[arg(short = 't', long, env = "KRAKEN_TOOLS_DIRS")]
    pub tools_dirs: Option<String>,

    /// ClickHouse proxy address (host:port) for shipping logs
    #[arg(short = 'c', long, env = "KRAKEN_CLICKHOUSE_ADDR")]
    pub clickhouse_addr: Option<String>,

    /// System ID of the host, for agents installed in VMs or spawned in containers
    #[arg(long, env = "KRAKEN_SYSTEM_ID")]
    pub system_id: Option<String>,

    /// Exit after performing one job
    #[arg(long)]
    pub one_job: bool,
}

impl AgentArgs {
    pub fn into_config(self) -> AgentConfig {
        AgentConfig {
            server: self.server,
            data_dir: self.data_dir,
            tools_dirs: self
                .tools_dirs
                .as_deref()
                .map(parse_tools_dirs)
                .unwrap_or_default(),
            clickhouse_addr: self.clickhouse_addr.filter(|s| !s.is_empty()),
            system_id: self.system_id.filter(|s| !s.is_empty()),
            one_job: self.one_job,
            ..AgentConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "kraken-agent",
            "run",
            "-s",
            "http://kraken:6363",
            "-d",
            "/tmp/kk",
            "-t",
            "/opt/tools:/usr/local/tools",
            "--system-id",
            "17",
            "--one-job",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let cfg = args.into_config();
        assert_eq!(cfg.server, "http://kraken:6363");
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/kk"));
        assert_eq!(cfg.tools_dirs.len(), 2);
        assert_eq!(cfg.system_id.as_deref(), Some("17"));
        assert!(cfg.one_job);
        assert!(cfg.clickhouse_addr.is_none());
    }

    #[test]
    fn test_check_integrity_takes_no_flags() {
        let cli = Cli::try_parse_from(["kraken-agent", "check-integrity"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckIntegrity));
    }

    #[test]
    fn test_missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["kraken-agent"]).is_err());
    }

    #[test]
    fn test_install_long_flags() {
        let cli = Cli::try_parse_from([
            "kraken-agent",
            "install",
            "--server",
            "http://kraken",
            "--clickhouse-addr",
            "10.0.0.2:9001",
        ])
        .unwrap();
        let Commands::Install(args) = cli.command else {
            panic!("expected install");
        };
        assert_eq!(args.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(args.clickhouse_addr.as_deref(), Some("10.0.0.2:9001"));
    }
}
