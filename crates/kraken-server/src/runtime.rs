// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable server runtime.
//!
//! Wires the HTTP surface and the background loops around one
//! [`ServerContext`]:
//!
//! - HTTP server (agent backend, webhooks, badges)
//! - broker worker executing background tasks
//! - scheduler binding queued jobs to idle agents
//! - watchdog expiring jobs, runs and silent agents
//! - planner loop firing periodic stage triggers
//!
//! ```ignore
//! let runtime = ServerRuntime::builder()
//!     .persistence(persistence)
//!     .logstore(logstore)
//!     .bind_addr(config.http_addr)
//!     .build()?
//!     .start()
//!     .await?;
//! tokio::signal::ctrl_c().await?;
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use kraken_core::logstore::LogStore;
use kraken_core::persistence::Persistence;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::{BrokerWorker, BrokerWorkerConfig};
use crate::cloud::ProviderRegistry;
use crate::cloud::fleet::{FleetConfig, FleetManager};
use crate::context::{ServerContext, ServerSettings};
use crate::objstore::ObjectStore;
use crate::planner::{PlannerConfig, PlannerLoop};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::server;
use crate::tasks::TaskDispatcher;
use crate::watchdog::{Watchdog, WatchdogConfig};

/// Builder for a [`ServerRuntime`].
pub struct ServerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    logstore: Option<Arc<dyn LogStore>>,
    providers: Option<Arc<ProviderRegistry>>,
    bind_addr: SocketAddr,
    data_dir: PathBuf,
    settings: ServerSettings,
    log_ttl_days: u32,
    broker_config: BrokerWorkerConfig,
    scheduler_config: SchedulerConfig,
    watchdog_config: WatchdogConfig,
    planner_config: PlannerConfig,
}

impl Default for ServerRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            logstore: None,
            providers: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6363)),
            data_dir: PathBuf::from(".data"),
            settings: ServerSettings::default(),
            log_ttl_days: 30,
            broker_config: BrokerWorkerConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            watchdog_config: WatchdogConfig::default(),
            planner_config: PlannerConfig::default(),
        }
    }
}

impl ServerRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Log store (required).
    pub fn logstore(mut self, logstore: Arc<dyn LogStore>) -> Self {
        self.logstore = Some(logstore);
        self
    }

    /// Cloud providers. Default: the CLI-backed providers.
    pub fn providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// HTTP listen address. Default: `0.0.0.0:6363`.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Object store root. Default: `.data`.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Public URL of the server.
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.settings.server_url = url.into();
        self
    }

    /// Log store address handed to agents.
    pub fn clickhouse_addr(mut self, addr: Option<String>) -> Self {
        self.settings.clickhouse_addr = addr;
        self
    }

    /// TTL of every log table. Default: 30 days.
    pub fn log_ttl_days(mut self, days: u32) -> Self {
        self.log_ttl_days = days;
        self
    }

    pub fn broker_config(mut self, config: BrokerWorkerConfig) -> Self {
        self.broker_config = config;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn watchdog_config(mut self, config: WatchdogConfig) -> Self {
        self.watchdog_config = config;
        self
    }

    pub fn planner_config(mut self, config: PlannerConfig) -> Self {
        self.planner_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ServerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let logstore = self
            .logstore
            .ok_or_else(|| anyhow::anyhow!("logstore is required"))?;
        let providers = self
            .providers
            .unwrap_or_else(|| Arc::new(ProviderRegistry::with_cli_providers()));

        Ok(ServerRuntimeConfig {
            persistence,
            logstore,
            providers,
            bind_addr: self.bind_addr,
            data_dir: self.data_dir,
            settings: self.settings,
            log_ttl_days: self.log_ttl_days,
            broker_config: self.broker_config,
            scheduler_config: self.scheduler_config,
            watchdog_config: self.watchdog_config,
            planner_config: self.planner_config,
        })
    }
}

/// Configuration for a [`ServerRuntime`].
pub struct ServerRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    logstore: Arc<dyn LogStore>,
    providers: Arc<ProviderRegistry>,
    bind_addr: SocketAddr,
    data_dir: PathBuf,
    settings: ServerSettings,
    log_ttl_days: u32,
    broker_config: BrokerWorkerConfig,
    scheduler_config: SchedulerConfig,
    watchdog_config: WatchdogConfig,
    planner_config: PlannerConfig,
}

impl ServerRuntimeConfig {
    /// Shared context the runtime will run on.
    pub fn context(&self) -> ServerContext {
        let fleet = FleetManager::new(
            self.persistence.clone(),
            self.providers.clone(),
            FleetConfig {
                server_url: self.settings.server_url.clone(),
                clickhouse_addr: self.settings.clickhouse_addr.clone(),
                ..FleetConfig::default()
            },
        );
        ServerContext::new(
            self.persistence.clone(),
            Arc::new(ObjectStore::new(&self.data_dir)),
            self.logstore.clone(),
            Arc::new(fleet),
            self.settings.clone(),
        )
    }

    /// Prepare the log store, then spawn the HTTP server and background loops.
    pub async fn start(self) -> Result<ServerRuntime> {
        self.logstore.ensure_schema(self.log_ttl_days).await?;
        let ctx = self.context();

        let worker = BrokerWorker::new(
            self.persistence.clone(),
            &ctx.broker,
            Arc::new(TaskDispatcher::new(ctx.clone())),
            self.broker_config,
        );
        let scheduler = Scheduler::new(ctx.clone(), self.scheduler_config);
        let watchdog = Watchdog::new(ctx.clone(), self.watchdog_config);
        let planner = PlannerLoop::new(ctx.clone(), self.planner_config);

        let shutdowns = vec![
            worker.shutdown_handle(),
            scheduler.shutdown_handle(),
            watchdog.shutdown_handle(),
            planner.shutdown_handle(),
        ];
        let workers = vec![
            tokio::spawn(async move { worker.run().await }),
            tokio::spawn(async move { scheduler.run().await }),
            tokio::spawn(async move { watchdog.run().await }),
            tokio::spawn(async move { planner.run().await }),
        ];

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let app = server::router(ctx.clone());
        let bind_addr = self.bind_addr;
        let server_handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_shutdown_rx.wait_for(|stop| *stop).await;
            };
            server::serve(app, bind_addr, shutdown)
                .await
                .map_err(anyhow::Error::from)
        });

        info!(bind_addr = %bind_addr, "ServerRuntime started");

        Ok(ServerRuntime {
            ctx,
            server_handle,
            server_shutdown_tx,
            workers,
            shutdowns,
            bind_addr,
        })
    }
}

/// A running Kraken server.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ServerRuntime {
    ctx: ServerContext,
    server_handle: JoinHandle<Result<()>>,
    server_shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    shutdowns: Vec<Arc<Notify>>,
    bind_addr: SocketAddr,
}

impl ServerRuntime {
    pub fn builder() -> ServerRuntimeBuilder {
        ServerRuntimeBuilder::new()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Stop the HTTP server and every background loop, then wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("ServerRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        for shutdown in &self.shutdowns {
            shutdown.notify_one();
        }
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Background task panicked: {}", e);
            }
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("ServerRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("HTTP server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("HTTP server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if every task of the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && self.workers.iter().all(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kraken_core::logstore::MemoryLogStore;
    use kraken_core::persistence::MemoryPersistence;

    #[test]
    fn test_build_requires_persistence() {
        let err = ServerRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("persistence"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(MemoryLogStore::new());
        let runtime = ServerRuntime::builder()
            .persistence(Arc::new(MemoryPersistence::new()))
            .logstore(logs.clone())
            .providers(Arc::new(ProviderRegistry::new()))
            .bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .data_dir(dir.path())
            .log_ttl_days(7)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert_eq!(logs.ttl_days().await, Some(7));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(runtime.is_running());
        runtime.shutdown().await.unwrap();
    }
}
