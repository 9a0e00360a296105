// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Branch status badges served from the cached flow summary.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use kraken_core::model::FlowKind;
use kraken_core::persistence::BranchRecord;
use url::Url;

use crate::analyzer::{FlowSummary, completed_flow_summary};
use crate::context::ServerContext;
use crate::error::{Error, Result};

const SHIELDS_URL: &str = "https://img.shields.io/badge/";

/// Badge route group.
pub fn routes() -> Router<ServerContext> {
    Router::new()
        .route("/bk/branch/{branch_id}/badge", get(build_badge))
        .route("/bk/branch/{branch_id}/badge/tests", get(tests_badge))
        .route("/bk/branch/{branch_id}/badge/issues", get(issues_badge))
        .route("/bk/branch/{branch_id}/badge/cctray", get(cctray))
}

/// Shields.io image URL for a badge.
pub fn shield_url(label: &str, message: &str, color: &str) -> String {
    // a single dash separates the badge parts
    let escape = |s: &str| s.replace('-', "--");
    let mut url = match Url::parse(SHIELDS_URL) {
        Ok(url) => url,
        Err(_) => return SHIELDS_URL.to_string(),
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(&format!(
            "{}-{}-{}",
            escape(label),
            escape(message),
            color
        ));
    }
    url.to_string()
}

fn redirect(url: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
}

async fn load_branch(ctx: &ServerContext, branch_id: i64) -> Result<BranchRecord> {
    ctx.persistence
        .get_branch(branch_id)
        .await?
        .filter(|b| b.deleted.is_none())
        .ok_or_else(|| Error::NotFound("Branch not found".to_string()))
}

fn label(branch: &BranchRecord, what: &str) -> String {
    format!("Kraken {} of {}", what, branch.name).replace('-', "_")
}

/// Message and color of a badge, or the placeholder when nothing ran yet.
fn describe(
    summary: Option<&FlowSummary>,
    ready: impl FnOnce(&FlowSummary) -> (String, &'static str),
) -> (String, &'static str) {
    match summary {
        None => ("no flows yet".to_string(), "informational"),
        Some(s) if s.runs == 0 => ("no runs".to_string(), "informational"),
        Some(s) => ready(s),
    }
}

pub fn build_status(summary: Option<&FlowSummary>) -> (String, &'static str) {
    describe(summary, |s| {
        if s.runs_errored > 0 {
            (format!("{} failed", s.label), "critical")
        } else {
            (format!("{} success", s.label), "success")
        }
    })
}

pub fn tests_status(summary: Option<&FlowSummary>) -> (String, &'static str) {
    describe(summary, |s| {
        let color = if s.tests_total == 0 {
            "informational"
        } else if s.tests_passed == s.tests_total {
            "success"
        } else if s.regr_cnt > 0 {
            "critical"
        } else {
            "yellow"
        };
        (format!("{} of {} passed", s.tests_passed, s.tests_total), color)
    })
}

pub fn issues_status(summary: Option<&FlowSummary>) -> (String, &'static str) {
    describe(summary, |s| {
        let color = match (s.issues_total, s.issues_new) {
            (0, _) => "success",
            (_, 0) => "yellow",
            _ => "critical",
        };
        (format!("{} issues, {} new", s.issues_total, s.issues_new), color)
    })
}

async fn build_badge(
    State(ctx): State<ServerContext>,
    Path(branch_id): Path<i64>,
) -> Result<Response> {
    let branch = load_branch(&ctx, branch_id).await?;
    let summary = completed_flow_summary(&ctx, branch.id, FlowKind::Ci).await?;
    let (message, color) = build_status(summary.as_ref());
    Ok(redirect(shield_url(&label(&branch, "Build"), &message, color)))
}

async fn tests_badge(
    State(ctx): State<ServerContext>,
    Path(branch_id): Path<i64>,
) -> Result<Response> {
    let branch = load_branch(&ctx, branch_id).await?;
    let summary = completed_flow_summary(&ctx, branch.id, FlowKind::Ci).await?;
    let (message, color) = tests_status(summary.as_ref());
    Ok(redirect(shield_url(&label(&branch, "Tests"), &message, color)))
}

async fn issues_badge(
    State(ctx): State<ServerContext>,
    Path(branch_id): Path<i64>,
) -> Result<Response> {
    let branch = load_branch(&ctx, branch_id).await?;
    let summary = completed_flow_summary(&ctx, branch.id, FlowKind::Ci).await?;
    let (message, color) = issues_status(summary.as_ref());
    Ok(redirect(shield_url(&label(&branch, "Issues"), &message, color)))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// CCTray feed with one project for the branch.
pub fn cctray_xml(branch: &BranchRecord, summary: Option<&FlowSummary>, server_url: &str) -> String {
    let mut project = format!(
        r#"<Project name="{}" activity="Sleeping" webUrl="{}/branches/{}""#,
        xml_escape(&branch.name),
        xml_escape(server_url.trim_end_matches('/')),
        branch.id
    );
    match summary {
        Some(s) if s.runs > 0 => {
            let status = if s.runs_errored > 0 { "Failure" } else { "Success" };
            project.push_str(&format!(
                r#" lastBuildStatus="{}" lastBuildLabel="{}""#,
                status,
                xml_escape(&s.label)
            ));
            if let Some(at) = s.finished.or(s.created) {
                project.push_str(&format!(r#" lastBuildTime="{}""#, at.to_rfc3339()));
            }
        }
        _ => project.push_str(r#" lastBuildStatus="Unknown""#),
    }
    format!("<Projects>{}/></Projects>", project)
}

async fn cctray(State(ctx): State<ServerContext>, Path(branch_id): Path<i64>) -> Result<Response> {
    let branch = load_branch(&ctx, branch_id).await?;
    let summary = completed_flow_summary(&ctx, branch.id, FlowKind::Ci).await?;
    let xml = cctray_xml(&branch, summary.as_ref(), &ctx.settings.server_url);
    Ok(([(header::CONTENT_TYPE, "application/xml")], xml).into_response())
}
