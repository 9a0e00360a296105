// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Learned job timeouts.
//!
//! After every completed job the stage's timeout table entry for the job's
//! `name-sysid-grpid` key is re-estimated from the durations of the last
//! comparable jobs.

use kraken_core::model::{CompletionStatus, DEFAULT_JOB_TIMEOUT, MIN_JOB_TIMEOUT_SECS};
use kraken_core::persistence::{DurationQuery, JobRecord};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::context::ServerContext;
use crate::error::Result;

/// How many recent jobs are looked at.
pub const DURATION_SAMPLES: i64 = 10;

/// Fewer samples than this leave the timeout unchanged.
pub const MIN_SAMPLES: usize = 4;

const MARGIN: f64 = 1.7;

/// Estimate a job timeout in seconds from recent `(status, duration)` pairs.
///
/// `previous` is the currently learned value, `declared` the timeout written
/// in the schema; the result never drops below the latter. When one of the
/// samples timed out and the estimate would shrink, the previous value is
/// doubled instead.
pub fn estimate_timeout(
    samples: &[(CompletionStatus, i64)],
    previous: Option<i64>,
    declared: Option<i64>,
) -> Option<i64> {
    if samples.len() < MIN_SAMPLES {
        return None;
    }
    let longest = samples.iter().map(|(_, secs)| *secs).max().unwrap_or(0);
    let timed_out = samples
        .iter()
        .any(|(status, _)| *status == CompletionStatus::JobTimeout);

    let mut timeout = ((longest as f64 * MARGIN) as i64).max(MIN_JOB_TIMEOUT_SECS as i64);
    if timed_out {
        let old = previous.unwrap_or(DEFAULT_JOB_TIMEOUT.as_secs() as i64);
        if timeout < old {
            timeout = old * 2;
        }
    }
    if let Some(declared) = declared {
        timeout = timeout.max(declared);
    }
    Some(timeout)
}

/// Timeout declared for job `name` in a stage schema.
fn declared_timeout(schema: &Value, name: &str) -> Option<i64> {
    schema
        .get("jobs")?
        .as_array()?
        .iter()
        .find(|j| j.get("name").and_then(Value::as_str) == Some(name))?
        .get("timeout")?
        .as_i64()
}

/// Re-estimate and store the learned timeout of a completed job.
///
/// Returns the stored value when it changed.
pub async fn update_learned_timeout(ctx: &ServerContext, job: &JobRecord) -> Result<Option<i64>> {
    let Some(run) = ctx.persistence.get_run(job.run_id).await? else {
        return Ok(None);
    };
    let Some(stage) = ctx.persistence.get_stage(run.stage_id).await? else {
        return Ok(None);
    };
    let samples = ctx
        .persistence
        .recent_job_durations(&DurationQuery {
            stage_id: stage.id,
            name: job.name.clone(),
            agents_group_id: job.agents_group_id,
            system_id: job.system_id,
            limit: DURATION_SAMPLES,
        })
        .await?;

    let key = job.timeout_key();
    let previous = stage.timeouts.get(&key).and_then(Value::as_i64);
    let declared = declared_timeout(&stage.schema, &job.name);
    let Some(timeout) = estimate_timeout(&samples, previous, declared) else {
        debug!(job_id = job.id, samples = samples.len(), "Not enough jobs to estimate timeout");
        return Ok(None);
    };
    if previous == Some(timeout) {
        return Ok(None);
    }

    let mut timeouts = stage.timeouts.as_object().cloned().unwrap_or_default();
    timeouts.insert(key.clone(), json!(timeout));
    ctx.persistence
        .update_stage_timeouts(stage.id, &Value::Object(timeouts))
        .await?;
    info!(stage_id = stage.id, key = %key, timeout, ?previous, "Job timeout learned");
    Ok(Some(timeout))
}
