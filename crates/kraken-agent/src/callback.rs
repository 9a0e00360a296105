// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callback server and tool process coordination.
//!
//! For every tool command the agent listens on an ephemeral TCP port of the
//! context's return IP and passes that address to kktool with `-r`. kktool
//! connects back and writes one [`StepResult`] per line. While the process
//! runs the coordinator:
//!
//! - accepts connections and reads their frames
//! - keeps the latest frame as the command result, stamped with `duration`
//! - forwards frames of streaming commands to the server as they arrive
//! - sends keep-alive pings and stops the tool when the server cancels

use std::sync::atomic::Ordering;
use std::time::Duration;

use kraken_protocol::{FrameError, FramedStream, StepResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::client::ServerClient;
use crate::error::Result;
use crate::exec::{CancelToken, ExecContext, RunOutcome, ToolRun};
use crate::logship::StepLog;

/// Late connections are accepted this long after the tool exited.
const LATE_ACCEPT: Duration = Duration::from_millis(100);

/// Readers get this long to deliver buffered frames after the tool exited.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// What one tool command produced.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Latest frame, if the tool sent any.
    pub result: Option<StepResult>,
    pub outcome: RunOutcome,
}

impl Execution {
    pub fn cancelled(&self) -> bool {
        self.outcome == RunOutcome::Cancelled
    }
}

/// Runs tool commands of one step and relays their output.
#[derive(Clone)]
pub struct Coordinator {
    client: ServerClient,
    job_id: i64,
    step_idx: i32,
    keep_alive: Duration,
}

impl Coordinator {
    pub fn new(client: ServerClient, job_id: i64, step_idx: i32, keep_alive: Duration) -> Self {
        Self {
            client,
            job_id,
            step_idx,
            keep_alive,
        }
    }

    /// Run `run` in `ctx` with a fresh callback listener.
    pub async fn execute(
        &self,
        ctx: &dyn ExecContext,
        mut run: ToolRun,
        log: &StepLog,
        cancel: CancelToken,
    ) -> Result<Execution> {
        let listener = TcpListener::bind((ctx.return_ip(), 0)).await?;
        run.return_addr = listener.local_addr()?;
        debug!(
            job_id = self.job_id,
            step = self.step_idx,
            command = %run.command,
            return_addr = %run.return_addr,
            "Callback server listening"
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<StepResult>();
        let mut readers = JoinSet::new();
        let started = Instant::now();
        let mut result: Option<StepResult> = None;
        let mut keep_alive = interval_at(started + self.keep_alive, self.keep_alive);

        let child = ctx.run(&run, log, &cancel);
        tokio::pin!(child);

        let outcome = loop {
            tokio::select! {
                outcome = &mut child => break outcome?,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Tool connected");
                        readers.spawn(read_frames(stream, tx.clone()));
                    }
                    Err(e) => warn!(error = %e, "Accepting tool connection failed"),
                },
                Some(frame) = rx.recv() => {
                    self.on_frame(frame, &run, started, &mut result, &cancel).await;
                }
                _ = keep_alive.tick() => self.ping(&cancel).await,
            }
        };

        // connections made just before exit may still sit in the backlog
        while let Ok(Ok((stream, _))) = tokio::time::timeout(LATE_ACCEPT, listener.accept()).await {
            readers.spawn(read_frames(stream, tx.clone()));
        }
        drop(tx);
        let drained = tokio::time::timeout(READER_DRAIN, async {
            while readers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(job_id = self.job_id, step = self.step_idx, "Tool connection left open, closing it");
            readers.abort_all();
            while readers.join_next().await.is_some() {}
        }
        while let Some(frame) = rx.recv().await {
            self.on_frame(frame, &run, started, &mut result, &cancel).await;
        }

        let outcome = if cancel.load(Ordering::Relaxed) && outcome != RunOutcome::TimedOut {
            RunOutcome::Cancelled
        } else {
            outcome
        };
        Ok(Execution { result, outcome })
    }

    async fn on_frame(
        &self,
        mut frame: StepResult,
        run: &ToolRun,
        started: Instant,
        result: &mut Option<StepResult>,
        cancel: &CancelToken,
    ) {
        let duration = (started.elapsed().as_secs_f64() + 0.5).round() as u64;
        frame.data.insert("duration".into(), duration.into());
        debug!(
            job_id = self.job_id,
            step = self.step_idx,
            command = %run.command,
            status = ?frame.status,
            "Frame from tool"
        );

        if run.command.is_streaming() {
            match self
                .client
                .report_step_result(self.job_id, self.step_idx, frame.clone())
                .await
            {
                Ok(rsp) if rsp.cancel => {
                    info!(job_id = self.job_id, "Server cancelled the job");
                    cancel.store(true, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = self.job_id, error = %e, "Cannot report partial result"),
            }
        }
        *result = Some(frame);
    }

    async fn ping(&self, cancel: &CancelToken) {
        match self.client.keep_alive(Some(self.job_id)).await {
            Ok(rsp) if rsp.cancel => {
                info!(job_id = self.job_id, "Server cancelled the job");
                cancel.store(true, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = self.job_id, error = %e, "Keep-alive failed"),
        }
    }
}

async fn read_frames(stream: TcpStream, tx: mpsc::UnboundedSender<StepResult>) {
    let mut framed = FramedStream::new(stream);
    loop {
        match framed.read_frame::<StepResult>().await {
            Ok(frame) => {
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Err(FrameError::ConnectionClosed) => break,
            Err(e) => {
                warn!(error = %e, "Bad frame from tool, closing connection");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::cancel_token;
    use crate::logship::{LogContext, LogShipper};
    use crate::masking::SecretMasker;
    use crate::tools::ToolInvocation;
    use async_trait::async_trait;
    use kraken_protocol::{StepState, ToolCommand, write_frame};
    use serde_json::{Value, json};
    use std::net::IpAddr;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Connects back like kktool and writes canned frames.
    struct Scripted {
        frames: Vec<Value>,
    }

    #[async_trait]
    impl ExecContext for Scripted {
        fn kind(&self) -> &'static str {
            "scripted"
        }
        async fn start(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn return_ip(&self) -> IpAddr {
            IpAddr::from([127, 0, 0, 1])
        }
        async fn run(&self, run: &ToolRun, _log: &StepLog, _cancel: &CancelToken) -> Result<RunOutcome> {
            let mut stream = TcpStream::connect(run.return_addr).await?;
            for frame in &self.frames {
                write_frame(&mut stream, frame).await?;
            }
            Ok(RunOutcome::Exited(0))
        }
        async fn stop(&self) {}
    }

    fn log() -> StepLog {
        StepLog::new(SecretMasker::default(), LogShipper::new(), LogContext::default())
    }

    fn tool_run(command: ToolCommand) -> ToolRun {
        ToolRun::new(
            ToolInvocation::kktool("kktool", "kraken_shell"),
            command,
            "/tmp/step_0.json",
            "/tmp",
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_last_frame_is_the_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;
        let client = ServerClient::new(&server.uri(), "127.0.0.1").unwrap();
        let coord = Coordinator::new(client, 5, 0, Duration::from_secs(3600));

        let ctx = Scripted {
            frames: vec![
                json!({"status": "in-progress"}),
                json!({"status": "done", "commands": ["run_tests"]}),
            ],
        };
        let exec = coord
            .execute(&ctx, tool_run(ToolCommand::GetCommands), &log(), cancel_token())
            .await
            .unwrap();
        assert_eq!(exec.outcome, RunOutcome::Exited(0));
        let result = exec.result.unwrap();
        assert_eq!(result.status, StepState::Done);
        assert_eq!(result.commands(), vec![ToolCommand::RunTests]);
        assert!(result.data["duration"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_streaming_frames_are_forwarded_and_cancel_honoured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "msg": "step-result", "job_id": 5, "step_idx": 2
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cancel": true})))
            .expect(2)
            .mount(&server)
            .await;
        let client = ServerClient::new(&server.uri(), "127.0.0.1").unwrap();
        let coord = Coordinator::new(client, 5, 2, Duration::from_secs(3600));

        let ctx = Scripted {
            frames: vec![
                json!({"status": "in-progress", "test-results": [{"test": "a", "status": 1}]}),
                json!({"status": "done"}),
            ],
        };
        let exec = coord
            .execute(&ctx, tool_run(ToolCommand::RunTests), &log(), cancel_token())
            .await
            .unwrap();
        assert!(exec.cancelled());
        assert_eq!(exec.result.unwrap().status, StepState::Done);
    }

    #[tokio::test]
    async fn test_silent_tool_leaves_no_result() {
        let server = MockServer::start().await;
        let client = ServerClient::new(&server.uri(), "127.0.0.1").unwrap();
        let coord = Coordinator::new(client, 1, 0, Duration::from_secs(3600));
        let exec = coord
            .execute(&Scripted { frames: vec![] }, tool_run(ToolCommand::Run), &log(), cancel_token())
            .await
            .unwrap();
        assert!(exec.result.is_none());
        assert_eq!(exec.outcome, RunOutcome::Exited(0));
    }
}
