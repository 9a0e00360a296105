// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kraken Server
//!
//! Single process running:
//! - the agent backend, webhooks and badges over HTTP
//! - the background task broker
//! - the scheduler, watchdog and planner loops

use std::sync::Arc;

use kraken_core::logstore::{ClickHouseLogStore, LogStore, MemoryLogStore};
use kraken_core::persistence::PostgresPersistence;
use kraken_server::broker::BrokerWorkerConfig;
use kraken_server::config::Config;
use kraken_server::runtime::ServerRuntime;
use kraken_server::watchdog::WatchdogConfig;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kraken_server=info,kraken_core=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        server_url = %config.server_url,
        data_dir = %config.data_dir.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting Kraken server"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    info!("Connected to database");

    kraken_core::migrations::run_postgres(&pool).await?;
    info!("Database migrations applied");

    let persistence = Arc::new(PostgresPersistence::new(pool));

    let logstore: Arc<dyn LogStore> = match &config.clickhouse_url {
        Some(url) => {
            info!(url = %url, "Using ClickHouse log store");
            Arc::new(ClickHouseLogStore::new(url.clone())?)
        }
        None => {
            warn!("KRAKEN_CLICKHOUSE_URL not set, step logs are kept in memory only");
            Arc::new(MemoryLogStore::new())
        }
    };

    let runtime = ServerRuntime::builder()
        .persistence(persistence)
        .logstore(logstore)
        .bind_addr(config.http_addr)
        .data_dir(&config.data_dir)
        .server_url(&config.server_url)
        .clickhouse_addr(config.clickhouse_addr.clone())
        .log_ttl_days(config.log_ttl_days)
        .broker_config(BrokerWorkerConfig {
            concurrency: config.broker_workers,
            ..BrokerWorkerConfig::default()
        })
        .watchdog_config(WatchdogConfig {
            agent_timeout: config.agent_timeout,
            ..WatchdogConfig::default()
        })
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Kraken server ready");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    runtime.shutdown().await?;
    info!("Kraken server stopped");

    Ok(())
}
