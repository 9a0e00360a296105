// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log shipping to the ClickHouse proxy.
//!
//! Each record is one JSON datagram sent over UDP. Shipping is best effort:
//! a lost or unsendable record is dropped and never fails a step.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::masking::SecretMasker;

/// Port of the ClickHouse proxy when the address has none.
pub const DEFAULT_PROXY_PORT: u16 = 9001;

/// Messages are cut to this many bytes to stay inside one datagram.
const MAX_MESSAGE_BYTES: usize = 60_000;

/// Identifies where a log line came from.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogContext {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_kind: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// One shipped record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub message: String,
    pub host: String,
    pub path: String,
    pub lineno: u32,
    pub level: String,
    pub logger_name: String,
    #[serde(flatten)]
    pub context: LogContext,
}

impl LogEntry {
    pub fn new(context: &LogContext, level: &str, message: &str) -> Self {
        let mut message = message.to_string();
        if message.len() > MAX_MESSAGE_BYTES {
            let mut cut = MAX_MESSAGE_BYTES;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message,
            host: crate::host::hostname(),
            path: String::new(),
            lineno: 0,
            level: level.to_string(),
            logger_name: context.service.clone(),
            context: context.clone(),
        }
    }
}

struct Sink {
    socket: UdpSocket,
    target: SocketAddr,
    addr: String,
}

/// Cloneable handle to the current shipping destination.
#[derive(Clone, Default)]
pub struct LogShipper {
    sink: Arc<RwLock<Option<Sink>>>,
}

impl LogShipper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the shipper at `addr` (`host[:port]`), or disable it with `None`.
    pub async fn configure(&self, addr: Option<&str>) -> Result<()> {
        let Some(addr) = addr.map(str::trim).filter(|a| !a.is_empty()) else {
            *self.sink.write().await = None;
            return Ok(());
        };
        if let Some(current) = self.sink.read().await.as_ref()
            && current.addr == addr
        {
            return Ok(());
        }

        let with_port = if addr.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
            addr.to_string()
        } else {
            format!("{}:{}", addr, DEFAULT_PROXY_PORT)
        };
        let target = tokio::net::lookup_host(&with_port)
            .await?
            .next()
            .ok_or_else(|| Error::Config(format!("cannot resolve log address '{}'", addr)))?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        info!(addr = %addr, target = %target, "Shipping logs to ClickHouse proxy");
        *self.sink.write().await = Some(Sink {
            socket,
            target,
            addr: addr.to_string(),
        });
        Ok(())
    }

    pub async fn is_configured(&self) -> bool {
        self.sink.read().await.is_some()
    }

    pub async fn ship(&self, entry: &LogEntry) {
        let guard = self.sink.read().await;
        let Some(sink) = guard.as_ref() else {
            return;
        };
        let payload = match serde_json::to_vec(entry) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Cannot encode log record");
                return;
            }
        };
        if let Err(e) = sink.socket.send_to(&payload, sink.target).await {
            debug!(error = %e, target = %sink.target, "Log record dropped");
        }
    }
}

/// Sink for the output lines of one step: masks secrets, logs locally and
/// ships to the proxy.
#[derive(Clone)]
pub struct StepLog {
    masker: SecretMasker,
    shipper: LogShipper,
    context: Arc<LogContext>,
}

impl StepLog {
    pub fn new(masker: SecretMasker, shipper: LogShipper, context: LogContext) -> Self {
        Self {
            masker,
            shipper,
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &LogContext {
        &self.context
    }

    pub async fn line(&self, line: &str) {
        let masked = self.masker.mask(line.trim_end());
        info!(
            job_id = self.context.job.unwrap_or_default(),
            step = self.context.step.unwrap_or_default(),
            tool = self.context.tool.as_deref().unwrap_or(""),
            "{}",
            masked
        );
        self.shipper
            .ship(&LogEntry::new(&self.context, "INFO", &masked))
            .await;
    }
}
