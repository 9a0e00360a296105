// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job execution.
//!
//! A job runs inside one execution context. Its steps run strictly in index
//! order; for each step the agent:
//!
//! 1. evaluates the step's `when` predicate, reporting `skipped` if it says no
//! 2. writes `step_<idx>.json` into the job directory
//! 3. asks the tool for its commands (`get_commands`)
//! 4. collects tests and has the server dispatch them, if the tool can
//! 5. runs the streaming commands, whose frames go to the server live
//! 6. runs `run` with retries, or leaves it running in the background
//!
//! The job deadline bounds every command. Once it passes, the remaining
//! steps are skipped.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use kraken_protocol::{
    AgentResponse, JobDescriptor, StepDescriptor, StepResult, StepState, ToolCommand,
};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::callback::{Coordinator, Execution};
use crate::client::ServerClient;
use crate::config::{AgentConfig, ensure_dir};
use crate::error::{Error, Result};
use crate::exec::{self, CancelToken, ExecContext, RunOutcome, ToolRun, cancel_token};
use crate::logship::{LogContext, LogShipper, StepLog};
use crate::masking::SecretMasker;
use crate::tools::{self, ToolInvocation};

/// Limit for `get_commands` and `collect_tests`.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

/// How each step of a job ended, as seen by the agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobReport {
    pub steps: Vec<(i32, StepState)>,
    /// The server cancelled the job midway.
    pub cancelled: bool,
}

impl JobReport {
    pub fn state_of(&self, index: i32) -> Option<StepState> {
        self.steps
            .iter()
            .find(|(idx, _)| *idx == index)
            .map(|(_, state)| *state)
    }
}

/// Result of running one step.
struct StepRun {
    result: StepResult,
    /// Streaming frames already told the server everything.
    reported: bool,
    cancelled: bool,
}

impl StepRun {
    fn finished(result: StepResult) -> Self {
        Self {
            result,
            reported: false,
            cancelled: false,
        }
    }

    fn cancelled(result: StepResult) -> Self {
        Self {
            result,
            reported: false,
            cancelled: true,
        }
    }
}

/// `run` commands left running until the job ends.
#[derive(Default)]
struct Background {
    tasks: JoinSet<()>,
    cancels: Vec<CancelToken>,
}

impl Background {
    async fn shutdown(mut self) {
        if self.cancels.is_empty() {
            return;
        }
        info!(count = self.cancels.len(), "Stopping background steps");
        for cancel in &self.cancels {
            cancel.store(true, Ordering::Relaxed);
        }
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Everything needed to invoke the tool of one step.
struct StepEnv {
    coord: Coordinator,
    tool: ToolInvocation,
    step_file: PathBuf,
    cwd: PathBuf,
    user: Option<String>,
    log: StepLog,
    cancel: CancelToken,
}

impl StepEnv {
    fn tool_run(&self, command: ToolCommand, timeout: Duration) -> ToolRun {
        let mut run = ToolRun::new(
            self.tool.clone(),
            command,
            self.step_file.clone(),
            self.cwd.clone(),
            timeout,
        );
        run.user = self.user.clone();
        run
    }

    async fn invoke(
        &self,
        ctx: &dyn ExecContext,
        command: ToolCommand,
        timeout: Duration,
    ) -> Result<Execution> {
        let exec = self
            .coord
            .execute(ctx, self.tool_run(command, timeout), &self.log, self.cancel.clone())
            .await?;
        debug!(command = %command, outcome = ?exec.outcome, "Tool command finished");
        Ok(exec)
    }
}

/// Runs jobs handed out by the server.
#[derive(Clone)]
pub struct JobRunner {
    client: ServerClient,
    config: Arc<AgentConfig>,
    shipper: LogShipper,
    agent_ip: IpAddr,
    agent_id: Option<i64>,
}

impl JobRunner {
    pub fn new(client: ServerClient, config: AgentConfig, shipper: LogShipper, agent_ip: IpAddr) -> Self {
        Self {
            client,
            config: Arc::new(config),
            shipper,
            agent_ip,
            agent_id: None,
        }
    }

    /// Tag shipped log records with the server-side agent id.
    pub fn with_agent_id(mut self, agent_id: Option<i64>) -> Self {
        self.agent_id = agent_id;
        self
    }

    /// Run `job` to completion and report every step to the server.
    pub async fn run_job(&self, job: JobDescriptor) -> Result<JobReport> {
        let deadline = Instant::now() + Duration::from_secs(job.timeout.max(0) as u64);
        let job_dir = self.config.job_dir(job.id);
        ensure_dir(&job_dir)?;
        info!(
            job_id = job.id,
            name = %job.name,
            executor = %job.executor,
            steps = job.steps.len(),
            timeout_secs = job.timeout,
            job_dir = %job_dir.display(),
            "Starting job"
        );

        let mut report = JobReport::default();
        let ctx = exec::create_context(&job, &self.config, self.agent_ip);
        if let Err(e) = ctx.start(remaining(deadline).unwrap_or(Duration::ZERO)).await {
            error!(job_id = job.id, executor = ctx.kind(), error = %e, "Cannot start execution context");
            let first = job.steps.first().map(|s| s.index).unwrap_or(0);
            let result = e.to_step_result();
            report.steps.push((first, result.status));
            self.report(job.id, first, result).await;
            return Ok(report);
        }

        let masker = SecretMasker::new(job.secrets.iter().cloned());
        let mut background = Background::default();
        let mut any_error = false;
        let mut prev_ok: Option<bool> = None;
        let mut expired = false;

        for step in &job.steps {
            if step.status.is_terminal() {
                debug!(job_id = job.id, step = step.index, status = ?step.status, "Step already finished");
                any_error |= step.status == StepState::Error;
                prev_ok = Some(step.status == StepState::Done);
                continue;
            }

            if expired || !step.when().should_run(any_error, prev_ok) {
                info!(
                    job_id = job.id,
                    step = step.index,
                    when = step.when().as_str(),
                    expired,
                    "Skipping step"
                );
                report.steps.push((step.index, StepState::Skipped));
                prev_ok = Some(false);
                if self.report(job.id, step.index, StepResult::new(StepState::Skipped)).await.cancel {
                    report.cancelled = true;
                    break;
                }
                continue;
            }

            let mut step = step.clone();
            enrich_step(&job, &mut step);
            let run = match self
                .run_step(&job, &mut step, &ctx, &masker, deadline, &mut background)
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    error!(job_id = job.id, step = step.index, error = %e, "Step interrupted");
                    StepRun::finished(e.to_step_result())
                }
            };

            let status = run.result.status;
            info!(
                job_id = job.id,
                step = step.index,
                status = ?status,
                reason = run.result.reason().unwrap_or(""),
                "Step finished"
            );
            report.steps.push((step.index, status));
            any_error |= status == StepState::Error;
            prev_ok = Some(status == StepState::Done);
            expired = matches!(run.result.reason(), Some("timeout" | "job-timeout"));

            let mut cancelled = run.cancelled;
            if !run.cancelled && !run.reported {
                cancelled = self.report(job.id, step.index, run.result).await.cancel;
            }
            if cancelled {
                info!(job_id = job.id, "Job cancelled by server");
                report.cancelled = true;
                break;
            }
        }

        background.shutdown().await;
        ctx.stop().await;
        info!(job_id = job.id, cancelled = report.cancelled, "Job completed");
        Ok(report)
    }

    async fn run_step(
        &self,
        job: &JobDescriptor,
        step: &mut StepDescriptor,
        ctx: &Arc<dyn ExecContext>,
        masker: &SecretMasker,
        deadline: Instant,
        background: &mut Background,
    ) -> Result<StepRun> {
        info!(
            job_id = job.id,
            step = step.index,
            tool = %step.tool,
            remaining_secs = remaining(deadline).unwrap_or_default().as_secs(),
            "Running step"
        );
        if self
            .report(job.id, step.index, StepResult::in_progress())
            .await
            .cancel
        {
            return Ok(StepRun::cancelled(StepResult::in_progress()));
        }

        let job_dir = self.config.job_dir(job.id);
        let step_file = job_dir.join(format!("step_{}.json", step.index));
        write_step_file(&step_file, step).await?;

        let env = StepEnv {
            coord: Coordinator::new(
                self.client.clone(),
                job.id,
                step.index,
                self.config.keep_alive_interval,
            ),
            tool: tools::resolve(&self.config, step, ctx.runs_on_host()),
            step_file: step_file.clone(),
            cwd: job_dir,
            user: step.field_str("user").filter(|u| !u.is_empty()).map(str::to_string),
            log: StepLog::new(masker.clone(), self.shipper.clone(), self.log_context(job, step)),
            cancel: cancel_token(),
        };

        // what can the tool do
        let Some(timeout) = remaining(deadline) else {
            return Ok(job_timeout());
        };
        let exec = env
            .invoke(ctx.as_ref(), ToolCommand::GetCommands, timeout.min(PROBE_TIMEOUT))
            .await?;
        if exec.cancelled() {
            return Ok(StepRun::cancelled(StepResult::in_progress()));
        }
        let probe = settle(ToolCommand::GetCommands, exec);
        if probe.status != StepState::Done {
            return Ok(StepRun::finished(probe));
        }
        let commands = probe.commands();
        debug!(step = step.index, commands = ?commands, "Tool commands");
        if !commands
            .iter()
            .any(|c| c.is_streaming() || *c == ToolCommand::Run)
        {
            return Err(Error::Tool(format!(
                "tool {} offers no run command, only {:?}",
                step.tool, commands
            )));
        }

        if commands.contains(&ToolCommand::CollectTests) && step.tests().is_empty() {
            let Some(timeout) = remaining(deadline) else {
                return Ok(job_timeout());
            };
            let exec = env
                .invoke(ctx.as_ref(), ToolCommand::CollectTests, timeout.min(PROBE_TIMEOUT))
                .await?;
            if exec.cancelled() {
                return Ok(StepRun::cancelled(StepResult::in_progress()));
            }
            let collected = settle(ToolCommand::CollectTests, exec);
            if collected.status != StepState::Done {
                return Ok(StepRun::finished(collected));
            }
            let tests = collected.tests()?;
            if tests.is_empty() {
                return Ok(StepRun::finished(
                    StepResult::error("no-tests").with("msg", "tool collected no tests"),
                ));
            }
            info!(step = step.index, collected = tests.len(), "Dispatching tests");
            let rsp = self.client.dispatch_tests(job.id, step.index, tests.clone()).await?;
            let assigned = rsp.tests.unwrap_or(tests);
            info!(step = step.index, assigned = assigned.len(), "Tests assigned to this job");
            step.set_tests(&assigned);
            write_step_file(&step_file, step).await?;
        }

        let mut last: Option<StepResult> = None;
        for command in ToolCommand::STREAMING {
            if !commands.contains(&command) {
                continue;
            }
            let Some(timeout) = remaining(deadline) else {
                return Ok(job_timeout());
            };
            let exec = env.invoke(ctx.as_ref(), command, timeout).await?;
            if exec.cancelled() {
                return Ok(StepRun::cancelled(exec.result.unwrap_or_else(StepResult::in_progress)));
            }
            let result = settle(command, exec);
            if result.status == StepState::Error {
                return Ok(StepRun::finished(result));
            }
            last = Some(result);
        }

        if !commands.contains(&ToolCommand::Run) {
            // every frame was forwarded already; only an unfinished step needs a final word
            return Ok(match last {
                Some(result) if result.status.is_terminal() => StepRun {
                    result,
                    reported: true,
                    cancelled: false,
                },
                Some(_) | None => StepRun::finished(StepResult::done()),
            });
        }

        if step.background() {
            let Some(timeout) = remaining(deadline) else {
                return Ok(job_timeout());
            };
            self.spawn_background(ctx, &env, timeout, background);
            return Ok(StepRun::finished(
                StepResult::done().with("msg", "running in background"),
            ));
        }

        let attempts = step.attempts();
        let pause = step.sleep_time_after_attempt();
        let mut result = StepResult::error("no-result");
        for attempt in 1..=attempts {
            let Some(timeout) = remaining(deadline) else {
                return Ok(job_timeout());
            };
            let exec = env.invoke(ctx.as_ref(), ToolCommand::Run, timeout).await?;
            if exec.cancelled() {
                return Ok(StepRun::cancelled(exec.result.unwrap_or_else(StepResult::in_progress)));
            }
            result = settle(ToolCommand::Run, exec);
            if result.status == StepState::Done || result.reason() == Some("timeout") {
                break;
            }
            if attempt < attempts {
                info!(
                    step = step.index,
                    attempt,
                    attempts,
                    retry_in_secs = pause.as_secs(),
                    "Run failed, retrying"
                );
                tokio::time::sleep(pause).await;
            } else if attempts > 1 {
                info!(step = step.index, attempts, "Run failed, no more retries");
            }
        }
        Ok(StepRun::finished(result))
    }

    fn spawn_background(
        &self,
        ctx: &Arc<dyn ExecContext>,
        env: &StepEnv,
        timeout: Duration,
        background: &mut Background,
    ) {
        let cancel = cancel_token();
        let run = env.tool_run(ToolCommand::Run, timeout);
        let coord = env.coord.clone();
        let log = env.log.clone();
        let ctx = Arc::clone(ctx);
        let token = cancel.clone();
        info!(step = log.context().step.unwrap_or_default(), "Starting background step");
        background.tasks.spawn(async move {
            match coord.execute(ctx.as_ref(), run, &log, token).await {
                Ok(exec) => debug!(outcome = ?exec.outcome, "Background step ended"),
                Err(e) => warn!(error = %e, "Background step failed"),
            }
        });
        background.cancels.push(cancel);
    }

    fn log_context(&self, job: &JobDescriptor, step: &StepDescriptor) -> LogContext {
        LogContext {
            service: "tool".to_string(),
            agent: self.agent_id,
            branch: Some(job.branch_id),
            flow_kind: Some(job.flow_kind),
            flow: Some(job.flow_id),
            run: Some(job.run_id),
            job: Some(job.id),
            step: Some(step.index),
            tool: Some(step.tool.clone()),
        }
    }

    /// Report a step result. Failures are logged; the job goes on.
    async fn report(&self, job_id: i64, step_idx: i32, result: StepResult) -> AgentResponse {
        match self.client.report_step_result(job_id, step_idx, result).await {
            Ok(rsp) => rsp,
            Err(e) => {
                warn!(job_id, step = step_idx, error = %e, "Cannot report step result");
                AgentResponse::default()
            }
        }
    }
}

/// Time left until `deadline`, `None` once it passed.
fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn job_timeout() -> StepRun {
    StepRun::finished(StepResult::error("job-timeout").with("msg", "job deadline passed"))
}

/// Job attributes every tool gets in its step file.
fn enrich_step(job: &JobDescriptor, step: &mut StepDescriptor) {
    let fields = &mut step.fields;
    fields.insert("job_id".into(), job.id.into());
    fields.insert("branch_id".into(), job.branch_id.into());
    fields.insert("flow_kind".into(), job.flow_kind.into());
    fields.insert("flow_id".into(), job.flow_id.into());
    fields.insert("run_id".into(), job.run_id.into());
    if let Some(trigger) = &job.trigger_data {
        fields.insert("trigger_data".into(), trigger.clone());
    }
}

async fn write_step_file(path: &Path, step: &StepDescriptor) -> Result<()> {
    let body = serde_json::to_vec_pretty(step)?;
    tokio::fs::write(path, body).await?;
    Ok(())
}

/// Turn what a command produced into a step result.
fn settle(command: ToolCommand, exec: Execution) -> StepResult {
    match (exec.outcome, exec.result) {
        (RunOutcome::TimedOut, _) => {
            StepResult::error("timeout").with("msg", format!("{} timed out", command))
        }
        (_, Some(result)) => result,
        (RunOutcome::Exited(0), None) | (RunOutcome::Cancelled, None) => StepResult::error("no-result")
            .with("msg", format!("{} exited without sending a result", command)),
        (RunOutcome::Exited(code), None) => StepResult::error("retcode")
            .with("retcode", Value::from(code))
            .with("msg", format!("{} exited with code {}", command, code)),
    }
}
