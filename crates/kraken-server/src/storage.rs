// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run artifacts, user data documents and object transfer for agents.
//!
//! | Route | Use |
//! |-------|-----|
//! | `PUT /storage/{bucket}/{*key}` | agent uploads artifacts and caches |
//! | `GET /storage/{bucket}/{*key}` | agent downloads caches and tool packages |
//! | `GET /artifacts/public/r/{run_id}/{*path}` | public artifact of a run |
//! | `GET /artifacts/public/f/{flow_id}/{*path}` | newest public artifact of a flow |
//!
//! Storage routes answer only authorized agents named in the
//! `X-Kraken-Agent` header.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use kraken_core::model::{ArtifactSection, UserDataScope};
use kraken_core::persistence::{ArtifactRecord, ArtifactsSummary, NewArtifact};
use kraken_protocol::messages::StepResult;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::objstore::Bucket;

/// Header carrying the address of the agent calling a storage route.
pub const AGENT_HEADER: &str = "x-kraken-agent";

/// Tool locations with this prefix point into the server's object store.
pub const STORE_LOCATION_PREFIX: &str = "store:";

const MAX_OBJECT_SIZE: usize = 1024 * 1024 * 1024;

pub fn routes() -> Router<ServerContext> {
    let storage = Router::new()
        .route("/storage/{bucket}/{*key}", get(download).put(upload))
        .layer(DefaultBodyLimit::max(MAX_OBJECT_SIZE));
    Router::new()
        .merge(storage)
        .route("/artifacts/public/r/{run_id}/{*path}", get(run_artifact))
        .route("/artifacts/public/f/{flow_id}/{*path}", get(flow_artifact))
}

/// Object key of an artifact within its branch bucket.
pub fn artifact_prefix(section: ArtifactSection, flow_id: i64, run_id: i64) -> String {
    format!("{}/{}/{}", section.as_str(), flow_id, run_id)
}

pub fn artifact_key(section: ArtifactSection, flow_id: i64, run_id: i64, path: &str) -> String {
    format!(
        "{}/{}",
        artifact_prefix(section, flow_id, run_id),
        path.trim_start_matches('/')
    )
}

/// Public when asked for, or when the step publishes a report entry.
pub fn artifact_section(fields: &Map<String, Value>) -> ArtifactSection {
    let public = fields.get("public").and_then(Value::as_bool).unwrap_or(false);
    if public || fields.get("report_entry").is_some_and(|e| !e.is_null()) {
        ArtifactSection::Public
    } else {
        ArtifactSection::Private
    }
}

/// Download URL of a tool package kept in the object store; other
/// locations pass through untouched.
pub fn tool_location_url(server_url: &str, location: &str) -> String {
    match location.strip_prefix(STORE_LOCATION_PREFIX) {
        Some(object) => format!(
            "{}/bk/storage/{}",
            server_url.trim_end_matches('/'),
            object.trim_start_matches('/')
        ),
        None => location.to_string(),
    }
}

/// Where the `artifacts` tool uploads, added to its step fields.
pub fn enrich_artifacts_step(
    ctx: &ServerContext,
    fields: &mut Map<String, Value>,
    branch_id: i64,
    flow_id: i64,
    run_id: i64,
) {
    let section = artifact_section(fields);
    fields
        .entry("destination")
        .or_insert_with(|| Value::from("."));
    fields.insert(
        "storage_url".into(),
        Value::from(format!(
            "{}/bk/storage/{}",
            ctx.settings.server_url.trim_end_matches('/'),
            Bucket::Artifacts(branch_id).name()
        )),
    );
    fields.insert(
        "storage_prefix".into(),
        Value::from(artifact_prefix(section, flow_id, run_id)),
    );
}

/// Record the artifacts a step reported as uploaded and return the run's
/// totals afterwards.
pub async fn store_artifacts(
    ctx: &ServerContext,
    run_id: i64,
    fields: &Map<String, Value>,
    result: &StepResult,
) -> Result<Option<ArtifactsSummary>> {
    let Some(reported) = result.data.get("artifacts").and_then(Value::as_array) else {
        return Ok(None);
    };
    let section = artifact_section(fields);
    let mut rows = Vec::with_capacity(reported.len() + 1);
    if let Some(entry) = fields.get("report_entry").and_then(Value::as_str) {
        rows.push(NewArtifact {
            report_entry: Some(entry.to_string()),
            ..Default::default()
        });
    }
    for artifact in reported {
        let Some(path) = artifact.get("path").and_then(Value::as_str) else {
            warn!(run_id, ?artifact, "Artifact without a path");
            continue;
        };
        let report_entry = match section {
            ArtifactSection::Public => artifact
                .get("report_entry")
                .and_then(Value::as_str)
                .map(str::to_string),
            ArtifactSection::Private => None,
        };
        rows.push(NewArtifact {
            path: Some(path.to_string()),
            size: artifact.get("size").and_then(Value::as_i64).unwrap_or(0),
            report_entry,
        });
    }
    ctx.persistence
        .record_artifacts(run_id, section, &rows, Utc::now())
        .await?;

    let summary = ArtifactsSummary::from_records(&ctx.persistence.list_run_artifacts(run_id).await?);
    info!(
        run_id,
        section = section.as_str(),
        public_count = summary.public.count,
        private_count = summary.private.count,
        "Artifacts recorded"
    );
    Ok(Some(summary))
}

/// Apply a `data` step result to the user data of its project, branch or
/// flow. Returns whether a document was written.
pub async fn handle_data(
    ctx: &ServerContext,
    run_id: i64,
    fields: &Map<String, Value>,
    data: &Value,
) -> Result<bool> {
    let operation = fields.get("operation").and_then(Value::as_str).unwrap_or("set");
    if operation != "set" {
        warn!(run_id, operation, "Unsupported data operation");
        return Ok(false);
    }
    let scope_name = fields.get("scope").and_then(Value::as_str).unwrap_or("flow");
    let Some(scope) = UserDataScope::parse(scope_name) else {
        warn!(run_id, scope = scope_name, "Invalid data scope");
        return Ok(false);
    };
    let pointer = fields.get("json_pointer").and_then(Value::as_str).unwrap_or("/");
    let raw = match fields.get("value") {
        Some(value) if !value.is_null() => value,
        _ => data,
    };
    let value = match raw {
        Value::String(text) => match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(run_id, error = %e, "Data is not valid JSON");
                return Ok(false);
            }
        },
        other => other.clone(),
    };

    let run = ctx
        .persistence
        .get_run(run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))?;
    let flow = ctx
        .persistence
        .get_flow(run.flow_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("flow {}", run.flow_id)))?;
    let (id, current) = if scope == UserDataScope::Flow {
        (flow.id, flow.user_data)
    } else {
        let branch = ctx
            .persistence
            .get_branch(flow.branch_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("branch {}", flow.branch_id)))?;
        match scope {
            UserDataScope::Project => {
                let project = ctx
                    .persistence
                    .get_project(branch.project_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("project {}", branch.project_id)))?;
                (project.id, project.user_data)
            }
            UserDataScope::BranchCi => (branch.id, branch.user_data_ci),
            UserDataScope::BranchDev => (branch.id, branch.user_data_dev),
            _ => (branch.id, branch.user_data),
        }
    };

    let current = match current {
        Value::Null => Value::Object(Map::new()),
        doc => doc,
    };
    let updated = match set_at_pointer(current, pointer, value) {
        Ok(updated) => updated,
        Err(reason) => {
            warn!(run_id, pointer, %reason, "Cannot set user data");
            return Ok(false);
        }
    };
    ctx.persistence.set_user_data(scope, id, &updated).await?;
    info!(run_id, scope = scope_name, id, pointer, "User data updated");
    Ok(true)
}

/// Put `value` at a slash separated `pointer` inside `doc`.
///
/// An empty pointer replaces the whole document. Intermediate nodes must
/// exist; numeric parts index arrays and an index equal to the array
/// length appends.
pub fn set_at_pointer(mut doc: Value, pointer: &str, value: Value) -> std::result::Result<Value, String> {
    let path = pointer.trim_matches('/');
    if path.is_empty() {
        return Ok(value);
    }
    let parts: Vec<&str> = path.split('/').collect();
    let Some((last, parents)) = parts.split_last() else {
        return Ok(value);
    };
    let mut node = &mut doc;
    for part in parents {
        node = match node {
            Value::Object(map) => map.get_mut(*part),
            Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        }
        .ok_or_else(|| format!("no '{}' on the way to '{}'", part, pointer))?;
    }
    match node {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        Value::Array(items) => {
            let idx = last
                .parse::<usize>()
                .map_err(|_| format!("'{}' is not an array index", last))?;
            if idx < items.len() {
                items[idx] = value;
            } else if idx == items.len() {
                items.push(value);
            } else {
                return Err(format!("index {} past the end of '{}'", idx, pointer));
            }
        }
        _ => return Err(format!("'{}' does not lead to an object or array", pointer)),
    }
    Ok(doc)
}

fn content_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("txt" | "log") => "text/plain; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

async fn authorize(ctx: &ServerContext, headers: &HeaderMap, bucket: &str) -> Result<Bucket> {
    let address = headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| Error::Forbidden("missing agent address".into()))?;
    let agent = ctx.persistence.find_agent_by_address(address).await?;
    if !agent.is_some_and(|a| a.authorized && a.deleted.is_none()) {
        return Err(Error::Forbidden(format!("agent {}", address)));
    }
    Bucket::parse(bucket).ok_or_else(|| Error::NotFound(format!("bucket {}", bucket)))
}

async fn upload(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode> {
    let bucket = authorize(&ctx, &headers, &bucket).await?;
    ctx.objstore.put(bucket, &key, &body).await?;
    debug!(bucket = %bucket.name(), key, size = body.len(), "Object stored");
    Ok(StatusCode::CREATED)
}

async fn download(
    State(ctx): State<ServerContext>,
    headers: HeaderMap,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response> {
    let bucket = authorize(&ctx, &headers, &bucket).await?;
    let data = ctx
        .objstore
        .get(bucket, &key)
        .await?
        .ok_or_else(|| Error::NotFound(format!("object {}/{}", bucket.name(), key)))?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

async fn run_artifact(
    State(ctx): State<ServerContext>,
    Path((run_id, path)): Path<(i64, String)>,
) -> Result<Response> {
    let records = ctx.persistence.list_run_artifacts(run_id).await?;
    serve_public(&ctx, &records, &path).await
}

async fn flow_artifact(
    State(ctx): State<ServerContext>,
    Path((flow_id, path)): Path<(i64, String)>,
) -> Result<Response> {
    let records = ctx.persistence.list_flow_artifacts(flow_id).await?;
    serve_public(&ctx, &records, &path).await
}

async fn serve_public(ctx: &ServerContext, records: &[ArtifactRecord], path: &str) -> Result<Response> {
    let path = path.trim_start_matches('/');
    let record = records
        .iter()
        .rev()
        .find(|a| a.section == ArtifactSection::Public && a.path.as_deref() == Some(path))
        .ok_or_else(|| Error::NotFound(format!("artifact {}", path)))?;
    let flow = ctx
        .persistence
        .get_flow(record.flow_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("flow {}", record.flow_id)))?;
    let key = artifact_key(record.section, record.flow_id, record.run_id, path);
    let data = ctx
        .objstore
        .get(Bucket::Artifacts(flow.branch_id), &key)
        .await?
        .ok_or_else(|| Error::NotFound(format!("artifact {}", path)))?;
    Ok(([(header::CONTENT_TYPE, content_type(path))], data).into_response())
}
