// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for kraken-server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL
    pub database_url: String,
    /// HTTP listen address for the agent backend, webhooks and badges
    pub http_addr: SocketAddr,
    /// Public URL of this server, used in badges and agent bootstrap scripts
    pub server_url: String,
    /// ClickHouse HTTP interface, e.g. `http://localhost:8123`
    pub clickhouse_url: Option<String>,
    /// ClickHouse native address handed to agents in `cfg`
    pub clickhouse_addr: Option<String>,
    /// Data directory for the object store
    pub data_dir: PathBuf,
    /// TTL applied to every log table
    pub log_ttl_days: u32,
    /// Number of concurrent background task workers
    pub broker_workers: usize,
    /// Agents not seen for this long are disabled
    pub agent_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("KRAKEN_DB_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("KRAKEN_DB_URL or DATABASE_URL"))?;

        let port: u16 = std::env::var("KRAKEN_SERVER_PORT")
            .unwrap_or_else(|_| "6363".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let server_url = std::env::var("KRAKEN_SERVER_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port));

        let clickhouse_url = non_empty_var("KRAKEN_CLICKHOUSE_URL");
        let clickhouse_addr = non_empty_var("KRAKEN_CLICKHOUSE_ADDR");

        let data_dir =
            PathBuf::from(std::env::var("KRAKEN_DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let log_ttl_days = parse_var("KRAKEN_LOG_TTL_DAYS", 30)?;
        let broker_workers = parse_var("KRAKEN_BROKER_WORKERS", 4)?;
        if broker_workers == 0 {
            return Err(ConfigError::Invalid(
                "KRAKEN_BROKER_WORKERS",
                "must be at least 1".to_string(),
            ));
        }
        let agent_timeout = Duration::from_secs(parse_var("KRAKEN_AGENT_TIMEOUT_SECS", 300)?);

        Ok(Self {
            database_url,
            http_addr,
            server_url,
            clickhouse_url,
            clickhouse_addr,
            data_dir,
            log_ttl_days,
            broker_workers,
            agent_timeout,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A variable is present but cannot be used.
    #[error("Invalid value of {0}: {1}")]
    Invalid(&'static str, String),
}
