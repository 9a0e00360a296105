// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Issue history: how long each static-analysis finding has been around.

use kraken_core::persistence::{FlowRecord, IssueRecord, JobRecord, PriorJobQuery, RunRecord};
use tracing::debug;

use crate::context::ServerContext;
use crate::error::Result;

/// Maximum line drift between an issue and its earlier occurrence.
pub const LINE_WINDOW: i32 = 5;

/// The nearest earlier issue with the same path, type and symbol within
/// [`LINE_WINDOW`] lines.
pub fn match_issue<'a>(issue: &IssueRecord, prior: &'a [IssueRecord]) -> Option<&'a IssueRecord> {
    prior
        .iter()
        .filter(|p| {
            p.path == issue.path && p.issue_type == issue.issue_type && p.symbol == issue.symbol
        })
        .map(|p| ((p.line - issue.line).abs(), p))
        .filter(|(dist, _)| *dist <= LINE_WINDOW)
        .min_by_key(|(dist, p)| (*dist, p.id))
        .map(|(_, p)| p)
}

/// Age the issues of a job against the previous comparable CI job.
///
/// Returns the number of new issues. Without a previous job nothing is
/// counted as new.
pub async fn analyze_job_issues(
    ctx: &ServerContext,
    job: &JobRecord,
    run: &RunRecord,
    flow: &FlowRecord,
) -> Result<i32> {
    let previous = ctx
        .persistence
        .previous_job_for_issues(&PriorJobQuery {
            name: job.name.clone(),
            stage_id: run.stage_id,
            agents_group_id: job.agents_group_id,
            system_id: job.system_id,
            flow_created_before: flow.created,
        })
        .await?;
    let Some(previous) = previous else {
        debug!(job_id = job.id, "No previous job for issue history");
        return Ok(0);
    };

    let prior = ctx.persistence.list_job_issues(previous.id).await?;
    let mut new_issues = 0;
    for issue in ctx.persistence.list_job_issues(job.id).await? {
        let age = match_issue(&issue, &prior).map_or(0, |p| p.age + 1);
        if age != issue.age {
            ctx.persistence.update_issue_age(issue.id, age).await?;
        }
        if age == 0 {
            new_issues += 1;
        }
    }
    debug!(job_id = job.id, previous_job_id = previous.id, new_issues, "Job issues analyzed");
    Ok(new_issues)
}
