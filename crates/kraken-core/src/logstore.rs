// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log store façade.
//!
//! Log rows are append-only and keyed by `(branch, flow, run, job, step, agent)`.
//! The production backend is ClickHouse reached over its HTTP interface; rows
//! go in as `JSONEachRow`. Every log table carries the same TTL.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::CoreError;

/// Log tables managed by [`LogStore::ensure_schema`].
pub const LOG_TABLES: [LogTable; 2] = [LogTable::Logs, LogTable::AgentLogs];

/// Destination table of a log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTable {
    /// Job, step and server logs.
    Logs,
    /// Agent process logs not bound to a job.
    AgentLogs,
}

impl LogTable {
    /// Table name in the store.
    pub fn name(self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::AgentLogs => "agent_logs",
        }
    }
}

/// One log line with its routing keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emission time.
    #[serde(with = "clickhouse_time")]
    pub time: DateTime<Utc>,
    /// Sequence within `time`, keeps ordering of lines emitted in the same instant.
    pub seq: u64,
    pub branch: u64,
    pub flow_kind: u8,
    pub flow: u64,
    pub run: u64,
    pub job: u64,
    pub step: i32,
    pub agent: u64,
    pub service: String,
    pub tool: String,
    pub host: String,
    pub path: String,
    pub lineno: u32,
    pub level: String,
    pub message: String,
}

mod clickhouse_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S"))
            .map(|n| n.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// Append-only sink for structured log rows.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create missing log tables and apply `ttl_days` to all of them.
    async fn ensure_schema(&self, ttl_days: u32) -> Result<(), CoreError>;

    /// Append rows to `table`. An empty slice is a no-op.
    async fn insert(&self, table: LogTable, rows: &[LogRecord]) -> Result<(), CoreError>;
}

/// ClickHouse HTTP backend.
pub struct ClickHouseLogStore {
    client: reqwest::Client,
    base_url: String,
}

impl ClickHouseLogStore {
    /// Connect lazily to the HTTP interface at `base_url` (e.g. `http://localhost:8123`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoreError::LogStore {
                details: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn execute(&self, query: &str, body: Option<String>) -> Result<(), CoreError> {
        let request = self
            .client
            .post(format!("{}/", self.base_url))
            .query(&[("query", query)]);
        let request = match body {
            Some(body) => request.body(body),
            None => request,
        };
        let response = request.send().await.map_err(|e| CoreError::LogStore {
            details: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::LogStore {
                details: format!("{}: {}", status, text.trim()),
            });
        }
        Ok(())
    }
}

/// DDL for a log table with the given TTL.
pub fn create_table_sql(table: LogTable, ttl_days: u32) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         time DateTime64(6), seq UInt64, branch UInt64, flow_kind UInt8, flow UInt64, \
         run UInt64, job UInt64, step Int32, agent UInt64, service String, tool String, \
         host String, path String, lineno UInt32, level String, message String\
         ) ENGINE = MergeTree ORDER BY (time, seq) {}",
        table.name(),
        ttl_clause(ttl_days)
    )
}

/// `ALTER` statement bringing an existing table to the given TTL.
pub fn modify_ttl_sql(table: LogTable, ttl_days: u32) -> String {
    format!("ALTER TABLE {} MODIFY {}", table.name(), ttl_clause(ttl_days))
}

fn ttl_clause(ttl_days: u32) -> String {
    format!("TTL toDateTime(time) + INTERVAL {} DAY", ttl_days)
}

#[async_trait]
impl LogStore for ClickHouseLogStore {
    async fn ensure_schema(&self, ttl_days: u32) -> Result<(), CoreError> {
        for table in LOG_TABLES {
            self.execute(&create_table_sql(table, ttl_days), None).await?;
            self.execute(&modify_ttl_sql(table, ttl_days), None).await?;
        }
        info!(ttl_days, "Log store schema ensured");
        Ok(())
    }

    async fn insert(&self, table: LogTable, rows: &[LogRecord]) -> Result<(), CoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }
        let query = format!("INSERT INTO {} FORMAT JSONEachRow", table.name());
        self.execute(&query, Some(body)).await?;
        debug!(table = table.name(), rows = rows.len(), "Inserted log rows");
        Ok(())
    }
}

/// In-process recorder used when no log server is configured and in tests.
#[derive(Default)]
pub struct MemoryLogStore {
    rows: Mutex<Vec<(LogTable, LogRecord)>>,
    ttl_days: Mutex<Option<u32>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows recorded for `table`, in insertion order.
    pub async fn rows(&self, table: LogTable) -> Vec<LogRecord> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|(t, _)| *t == table)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// TTL applied by the last `ensure_schema` call.
    pub async fn ttl_days(&self) -> Option<u32> {
        *self.ttl_days.lock().await
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn ensure_schema(&self, ttl_days: u32) -> Result<(), CoreError> {
        *self.ttl_days.lock().await = Some(ttl_days);
        Ok(())
    }

    async fn insert(&self, table: LogTable, rows: &[LogRecord]) -> Result<(), CoreError> {
        self.rows
            .lock()
            .await
            .extend(rows.iter().cloned().map(|r| (table, r)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(msg: &str) -> LogRecord {
        LogRecord {
            time: DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            job: 7,
            level: "INFO".into(),
            message: msg.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ttl_is_applied_to_every_table() {
        for table in LOG_TABLES {
            let create = create_table_sql(table, 14);
            assert!(create.contains(table.name()));
            assert!(create.contains("INTERVAL 14 DAY"));
            assert!(modify_ttl_sql(table, 14).ends_with("INTERVAL 14 DAY"));
        }
    }

    #[test]
    fn test_record_time_format() {
        let json = serde_json::to_value(record("x")).unwrap();
        assert_eq!(json["time"], "2025-03-01 10:00:00.000000");
        let back: LogRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.time, record("x").time);
    }

    #[tokio::test]
    async fn test_clickhouse_insert_posts_json_each_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("query", "INSERT INTO logs FORMAT JSONEachRow"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = ClickHouseLogStore::new(server.uri()).unwrap();
        store
            .insert(LogTable::Logs, &[record("a"), record("b")])
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.contains("\"message\":\"b\""));
    }

    #[tokio::test]
    async fn test_clickhouse_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = ClickHouseLogStore::new(server.uri()).unwrap();
        let err = store.ensure_schema(30).await.unwrap_err();
        assert!(matches!(err, CoreError::LogStore { .. }));
    }

    #[tokio::test]
    async fn test_empty_insert_makes_no_request() {
        let server = MockServer::start().await;
        let store = ClickHouseLogStore::new(server.uri()).unwrap();
        store.insert(LogTable::AgentLogs, &[]).await.unwrap();
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_records_per_table() {
        let store = MemoryLogStore::new();
        store.ensure_schema(5).await.unwrap();
        store.insert(LogTable::Logs, &[record("a")]).await.unwrap();
        store
            .insert(LogTable::AgentLogs, &[record("b")])
            .await
            .unwrap();
        assert_eq!(store.rows(LogTable::Logs).await.len(), 1);
        assert_eq!(store.rows(LogTable::AgentLogs).await[0].message, "b");
        assert_eq!(store.ttl_days().await, Some(5));
    }
}
