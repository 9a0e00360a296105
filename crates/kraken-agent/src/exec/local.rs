// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local execution: tools run as child processes of the agent.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{CancelToken, ExecContext, RunOutcome, ToolRun, run_process};
use crate::error::Result;
use crate::logship::StepLog;

#[derive(Debug, Default)]
pub struct LocalContext;

impl LocalContext {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecContext for LocalContext {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn start(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn return_ip(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn runs_on_host(&self) -> bool {
        true
    }

    async fn run(&self, run: &ToolRun, log: &StepLog, cancel: &CancelToken) -> Result<RunOutcome> {
        let args = run.args(&run.step_file);
        let mut cmd = match run.user.as_deref() {
            Some(user) => {
                let mut cmd = Command::new("sudo");
                cmd.args(["-n", "-u", user, "--"]).arg(&run.tool.program);
                cmd
            }
            None => Command::new(&run.tool.program),
        };
        cmd.args(&args).current_dir(&run.cwd);
        info!(
            program = %run.tool.program,
            command = %run.command,
            cwd = %run.cwd.display(),
            timeout_secs = run.timeout.as_secs(),
            "Running tool"
        );
        run_process(cmd, log, run.timeout, cancel).await
    }

    async fn stop(&self) {}
}
