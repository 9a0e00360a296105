// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handles of the server components.

use std::sync::Arc;

use kraken_core::logstore::LogStore;
use kraken_core::persistence::Persistence;
use tokio::sync::Notify;

use crate::broker::Broker;
use crate::cloud::fleet::FleetManager;
use crate::objstore::ObjectStore;

/// Values handed to agents and embedded in URLs.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Public URL of the server.
    pub server_url: String,
    /// Log store address agents write to.
    pub clickhouse_addr: Option<String>,
    /// Version reported to agents in every response.
    pub version: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:6363".to_string(),
            clickhouse_addr: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Everything a task, a worker or a request handler needs.
///
/// Cloning is cheap; all members are shared.
#[derive(Clone)]
pub struct ServerContext {
    pub persistence: Arc<dyn Persistence>,
    pub broker: Broker,
    pub objstore: Arc<ObjectStore>,
    pub logstore: Arc<dyn LogStore>,
    pub fleet: Arc<FleetManager>,
    /// Raised when jobs become queued or agents become idle.
    pub scheduler_wakeup: Arc<Notify>,
    pub settings: ServerSettings,
}

impl ServerContext {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        objstore: Arc<ObjectStore>,
        logstore: Arc<dyn LogStore>,
        fleet: Arc<FleetManager>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            broker: Broker::new(persistence.clone()),
            persistence,
            objstore,
            logstore,
            fleet,
            scheduler_wakeup: Arc::new(Notify::new()),
            settings,
        }
    }

    /// Ask the scheduler for an early pass.
    pub fn wake_scheduler(&self) {
        self.scheduler_wakeup.notify_one();
    }
}
