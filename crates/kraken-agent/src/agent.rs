// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent main loop.
//!
//! The agent introduces itself with `sys-info`, then polls `get-job`. Each
//! response may carry a configuration update, which is merged before the
//! job runs. Jobs run one at a time; the loop exits on shutdown or after
//! the first job in `--one-job` mode.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::client::ServerClient;
use crate::config::{AgentConfig, ensure_dir};
use crate::error::Result;
use crate::host;
use crate::jobber::JobRunner;
use crate::logship::LogShipper;

pub struct Agent {
    config: AgentConfig,
    client: ServerClient,
    shipper: LogShipper,
    agent_ip: IpAddr,
    agent_id: Option<i64>,
    shutdown: Arc<Notify>,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        ensure_dir(&config.data_dir)?;
        ensure_dir(&config.jobs_dir())?;

        let (address, agent_ip) = host::agent_address(&config.server).await?;
        let client = ServerClient::new(&config.server, address)?;
        let shipper = LogShipper::new();
        if let Err(e) = shipper.configure(config.clickhouse_addr.as_deref()).await {
            warn!(error = %e, "Log shipping disabled");
        }
        info!(
            server = %config.server,
            address = %client.address(),
            data_dir = %config.data_dir.display(),
            "Agent initialized"
        );

        Ok(Self {
            config,
            client,
            shipper,
            agent_ip,
            agent_id: None,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Get a handle that can be used to signal shutdown.
    ///
    /// A job in progress is finished first.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn agent_id(&self) -> Option<i64> {
        self.agent_id
    }

    /// Report host info until the server authorizes this agent.
    ///
    /// Returns false if shutdown was requested while waiting.
    pub async fn register(&mut self) -> Result<bool> {
        loop {
            let info = host::collect_host_info(self.config.system_id.as_deref()).await;
            debug!(system = %info.system, isolation = %info.isolation, "Reporting host info");
            let rsp = self.client.report_host_info(info).await?;
            if !rsp.unauthorized {
                self.agent_id = rsp.agent_id.or(self.agent_id);
                info!(agent_id = ?self.agent_id, "Agent registered");
                return Ok(true);
            }
            warn!(
                retry_in_secs = self.config.unauthorized_sleep.as_secs(),
                "Agent not authorized yet"
            );
            if !self.pause(self.config.unauthorized_sleep).await {
                return Ok(false);
            }
        }
    }

    /// Run the polling loop until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        if !self.register().await? {
            info!("Agent stopped before registering");
            return Ok(());
        }

        loop {
            let rsp = tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Agent received shutdown signal");
                    break;
                }

                rsp = self.client.get_job() => rsp,
            };

            let rsp = match rsp {
                Ok(rsp) => rsp,
                Err(e) => {
                    error!(error = %e, "Polling for a job failed");
                    if !self.pause(self.config.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            if rsp.unauthorized {
                warn!("Agent lost its authorization");
                if !self.pause(self.config.unauthorized_sleep).await || !self.register().await? {
                    break;
                }
                continue;
            }

            if let Some(cfg) = &rsp.cfg
                && self.config.apply_cfg(cfg)
            {
                info!(clickhouse_addr = ?self.config.clickhouse_addr, "Configuration updated");
                if let Err(e) = self
                    .shipper
                    .configure(self.config.clickhouse_addr.as_deref())
                    .await
                {
                    warn!(error = %e, "Cannot reconfigure log shipping");
                }
            }
            if let Some(version) = rsp.version.as_deref()
                && version != env!("CARGO_PKG_VERSION")
            {
                debug!(server_version = %version, agent_version = env!("CARGO_PKG_VERSION"), "Version mismatch");
            }

            let Some(job) = rsp.job else {
                if !self.pause(self.config.poll_interval).await {
                    break;
                }
                continue;
            };

            let job_id = job.id;
            let runner = JobRunner::new(
                self.client.clone(),
                self.config.clone(),
                self.shipper.clone(),
                self.agent_ip,
            )
            .with_agent_id(self.agent_id);
            match runner.run_job(job).await {
                Ok(report) => info!(job_id, cancelled = report.cancelled, steps = report.steps.len(), "Job done"),
                Err(e) => error!(job_id, error = %e, "Job failed"),
            }

            if self.config.one_job {
                info!("One job mode, exiting");
                break;
            }
        }

        info!("Agent stopped");
        Ok(())
    }

    /// Sleep for `duration`. Returns false if shutdown was requested.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown.notified() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, dir: &tempfile::TempDir) -> AgentConfig {
        let mut cfg = AgentConfig::new(server.uri());
        cfg.data_dir = dir.path().to_path_buf();
        cfg.poll_interval = Duration::from_millis(20);
        cfg.unauthorized_sleep = Duration::from_millis(20);
        cfg.system_id = Some("5".into());
        cfg
    }

    #[tokio::test]
    async fn test_new_rejects_bad_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::new("ftp://server");
        cfg.data_dir = dir.path().to_path_buf();
        assert!(Agent::new(cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_register_waits_for_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msg": "sys-info"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unauthorized": true})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msg": "sys-info", "info": {"system": "5"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"agent_id": 12})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::new(config(&server, &dir)).await.unwrap();
        assert!(agent.register().await.unwrap());
        assert_eq!(agent.agent_id(), Some(12));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_one_job_mode_runs_a_job_and_exits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msg": "sys-info"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"agent_id": 1})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msg": "get-job"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cfg": {"clickhouse_addr": "127.0.0.1:9001"},
                "job": {
                    "id": 3, "name": "empty", "timeout": 30, "branch_id": 1,
                    "flow_kind": 0, "flow_id": 1, "run_id": 1, "steps": []
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&server, &dir);
        cfg.one_job = true;
        let mut agent = Agent::new(cfg).await.unwrap();
        agent.run().await.unwrap();

        assert_eq!(agent.config().clickhouse_addr.as_deref(), Some("127.0.0.1:9001"));
        assert!(dir.path().join("jobs").join("3").is_dir());
    }

    #[tokio::test]
    async fn test_idle_agent_stops_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msg": "sys-info"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msg": "get-job"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job": {}})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::new(config(&server, &dir)).await.unwrap();
        let shutdown = agent.shutdown_handle();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.notify_one();
        });

        tokio::time::timeout(Duration::from_secs(5), agent.run())
            .await
            .expect("agent should stop")
            .unwrap();
        stopper.await.unwrap();
    }
}
