// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic stage triggers.
//!
//! A stage schema may declare `triggers.interval` (`"1h"`, `"30m"`,
//! `"1h30m"`), `triggers.cron` (a cron expression) or `triggers.date` (one
//! point in time). The planner loop evaluates them against the per-stage
//! trigger state and enqueues a CI run for every stage that is due. The next
//! fire times are persisted in the stage's trigger state so restarts do not
//! re-fire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use croner::Cron;
use kraken_core::model::FlowKind;
use serde_json::{Map, Value, json};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::broker::Task;
use crate::context::ServerContext;
use crate::error::Result;

/// Planner loop configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// How often stage triggers are evaluated.
    pub poll_interval: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
        }
    }
}

/// Parse durations like `90s`, `30m`, `1h30m`, `2d` or `1w`. A bare number
/// is seconds.
pub fn parse_interval(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<u64>() {
        return (secs > 0).then(|| Duration::from_secs(secs));
    }
    let mut total = 0u64;
    let mut number = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            'w' => 604_800,
            ' ' => continue,
            _ => return None,
        };
        let n: u64 = number.parse().ok()?;
        total = total.checked_add(n.checked_mul(unit)?)?;
        number.clear();
    }
    if !number.is_empty() || total == 0 {
        return None;
    }
    Some(Duration::from_secs(total))
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|t| t.and_utc())
}

fn state_time(state: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    state
        .get(key)
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Outcome of evaluating one stage's triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDecision {
    /// Names of the triggers that fired (`interval`, `cron`, `date`).
    pub fired: Vec<&'static str>,
    /// Trigger state to persist.
    pub state: Value,
}

/// Evaluate the trigger declarations `config` against the stored `state`.
///
/// A newly declared interval or cron schedule is armed without firing.
pub fn evaluate_triggers(config: &Value, state: &Value, now: DateTime<Utc>) -> TriggerDecision {
    let mut next_state = state.as_object().cloned().unwrap_or_default();
    let mut fired = Vec::new();

    match config.get("interval").and_then(Value::as_str) {
        Some(spec) => match parse_interval(spec) {
            Some(interval) => {
                let step = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::hours(1));
                let same_spec = next_state.get("interval").and_then(Value::as_str) == Some(spec);
                match state_time(&next_state, "interval_next") {
                    Some(next) if same_spec && now >= next => {
                        fired.push("interval");
                        next_state.insert("interval_next".into(), json!((now + step).to_rfc3339()));
                    }
                    Some(_) if same_spec => {}
                    _ => {
                        next_state.insert("interval_next".into(), json!((now + step).to_rfc3339()));
                    }
                }
                next_state.insert("interval".into(), json!(spec));
            }
            None => warn!(interval = spec, "Invalid trigger interval"),
        },
        None => {
            next_state.remove("interval");
            next_state.remove("interval_next");
        }
    }

    match config.get("cron").and_then(Value::as_str) {
        Some(expr) => match Cron::new(expr).parse() {
            Ok(cron) => {
                let same_expr = next_state.get("cron").and_then(Value::as_str) == Some(expr);
                let due = match state_time(&next_state, "cron_next") {
                    Some(next) if same_expr => now >= next,
                    _ => false,
                };
                let rearm = due || !same_expr || state_time(&next_state, "cron_next").is_none();
                if due {
                    fired.push("cron");
                }
                if rearm {
                    match cron.find_next_occurrence(&now, false) {
                        Ok(next) => {
                            next_state.insert("cron_next".into(), json!(next.to_rfc3339()));
                        }
                        Err(e) => warn!(cron = expr, error = %e, "No next cron occurrence"),
                    }
                }
                next_state.insert("cron".into(), json!(expr));
            }
            Err(e) => warn!(cron = expr, error = %e, "Invalid cron expression"),
        },
        None => {
            next_state.remove("cron");
            next_state.remove("cron_next");
        }
    }

    if let Some(spec) = config.get("date").and_then(Value::as_str) {
        match parse_date(spec) {
            Some(at) => {
                let done = next_state.get("date_fired").and_then(Value::as_str) == Some(spec);
                if !done && now >= at {
                    fired.push("date");
                    next_state.insert("date_fired".into(), json!(spec));
                }
            }
            None => warn!(date = spec, "Invalid trigger date"),
        }
    }

    TriggerDecision {
        fired,
        state: Value::Object(next_state),
    }
}

/// Background loop firing periodic stage triggers.
pub struct PlannerLoop {
    ctx: ServerContext,
    config: PlannerConfig,
    shutdown: Arc<Notify>,
}

impl PlannerLoop {
    pub fn new(ctx: ServerContext, config: PlannerConfig) -> Self {
        Self {
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Planner started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Planner received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check_triggers(Utc::now()).await {
                        error!(error = %e, "Failed to check stage triggers");
                    }
                }
            }
        }

        info!("Planner stopped");
    }

    /// Evaluate every enabled stage once. Returns the number of runs requested.
    pub async fn check_triggers(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut requested = 0;
        for stage in self.ctx.persistence.list_enabled_stages().await? {
            let Some(config) = stage.schema.get("triggers") else {
                continue;
            };
            if !["interval", "cron", "date"].iter().any(|k| config.get(*k).is_some())
                && stage.triggers.as_object().is_none_or(Map::is_empty)
            {
                continue;
            }
            let decision = evaluate_triggers(config, &stage.triggers, now);
            if decision.state != stage.triggers {
                self.ctx
                    .persistence
                    .update_stage_triggers(stage.id, &decision.state)
                    .await?;
            }
            if let Some(first) = decision.fired.first() {
                info!(stage_id = stage.id, trigger = *first, "Stage trigger fired");
                self.ctx
                    .broker
                    .enqueue(Task::TriggerRun {
                        stage_id: stage.id,
                        flow_kind: FlowKind::Ci,
                        reason: json!({"reason": first}),
                    })
                    .await?;
                requested += 1;
            }
        }
        debug!(requested, "Stage triggers checked");
        Ok(requested)
    }
}
