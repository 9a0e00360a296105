// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent configuration.
//!
//! Built from the command line (with environment fallbacks) and updated at
//! runtime from the `cfg` object the server attaches to `get-job` answers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kraken_protocol::AgentCfg;
use kraken_protocol::messages::{IDLE_POLL_INTERVAL, KEEP_ALIVE_INTERVAL, UNAUTHORIZED_RETRY_INTERVAL};

use crate::error::{Error, Result};

/// Default directory for job files.
pub const DEFAULT_DATA_DIR: &str = "/opt/kraken/data";

/// Live agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server base URL, e.g. `http://kraken.example.com:6363`.
    pub server: String,
    pub data_dir: PathBuf,
    /// Directories searched for `kktool` and `kraken_<tool>` programs.
    pub tools_dirs: Vec<PathBuf>,
    /// Log shipping address (`host[:port]`).
    pub clickhouse_addr: Option<String>,
    /// System id given at install time, reported instead of the detected distro.
    pub system_id: Option<String>,
    /// Exit after the first job.
    pub one_job: bool,
    pub poll_interval: Duration,
    pub unauthorized_sleep: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            tools_dirs: Vec::new(),
            clickhouse_addr: None,
            system_id: None,
            one_job: false,
            poll_interval: IDLE_POLL_INTERVAL,
            unauthorized_sleep: UNAUTHORIZED_RETRY_INTERVAL,
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
        }
    }
}

impl AgentConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::Config("server address is required".into()));
        }
        if !self.server.starts_with("http://") && !self.server.starts_with("https://") {
            return Err(Error::Config(format!(
                "server address must be an http(s) URL, got '{}'",
                self.server
            )));
        }
        Ok(())
    }

    /// `<data_dir>/jobs`
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn job_dir(&self, job_id: i64) -> PathBuf {
        self.jobs_dir().join(job_id.to_string())
    }

    /// Merge a server-pushed configuration. Returns true if anything changed.
    pub fn apply_cfg(&mut self, cfg: &AgentCfg) -> bool {
        match &cfg.clickhouse_addr {
            Some(addr) if self.clickhouse_addr.as_deref() != Some(addr.as_str()) => {
                self.clickhouse_addr = Some(addr.clone());
                true
            }
            _ => false,
        }
    }

    /// Locate a program in the tools directories.
    pub fn find_tool_file(&self, name: &str) -> Option<PathBuf> {
        self.tools_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }
}

/// Split a tools dirs list. Both `:` and `,` separate entries.
pub fn parse_tools_dirs(list: &str) -> Vec<PathBuf> {
    list.split([':', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Join a path list back into the form [`parse_tools_dirs`] reads.
pub fn join_tools_dirs(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        Error::Config(format!("cannot create directory {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_http_url() {
        assert!(AgentConfig::new("http://kraken:6363").validate().is_ok());
        assert!(AgentConfig::new("https://kraken").validate().is_ok());
        assert!(AgentConfig::new("").validate().is_err());
        assert!(AgentConfig::new("kraken:6363").validate().is_err());
    }

    #[test]
    fn test_job_dir_layout() {
        let mut cfg = AgentConfig::new("http://k");
        cfg.data_dir = PathBuf::from("/var/kk");
        assert_eq!(cfg.job_dir(42), PathBuf::from("/var/kk/jobs/42"));
    }

    #[test]
    fn test_apply_cfg_reports_changes_once() {
        let mut cfg = AgentConfig::new("http://k");
        let update = AgentCfg {
            clickhouse_addr: Some("ch:9001".into()),
            ..Default::default()
        };
        assert!(cfg.apply_cfg(&update));
        assert!(!cfg.apply_cfg(&update));
        assert_eq!(cfg.clickhouse_addr.as_deref(), Some("ch:9001"));
        assert!(!cfg.apply_cfg(&AgentCfg::default()));
    }

    #[test]
    fn test_parse_tools_dirs() {
        assert_eq!(
            parse_tools_dirs("/a:/b, /c,,"),
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
        assert!(parse_tools_dirs("").is_empty());
        assert_eq!(join_tools_dirs(&parse_tools_dirs("/a,/b")), "/a:/b");
    }

    #[test]
    fn test_find_tool_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kktool"), "#!/bin/sh\n").unwrap();
        let mut cfg = AgentConfig::new("http://k");
        cfg.tools_dirs = vec![PathBuf::from("/nonexistent"), dir.path().to_path_buf()];
        assert_eq!(cfg.find_tool_file("kktool"), Some(dir.path().join("kktool")));
        assert_eq!(cfg.find_tool_file("kraken_shell"), None);
    }
}
