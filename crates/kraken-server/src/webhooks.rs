// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository webhooks.
//!
//! Each provider endpoint checks that the project accepts its hooks, verifies
//! the request, reduces the payload to a trigger object and enqueues
//! [`Task::TriggerFlow`]. Triggers carry `trigger` (`<provider>-push` or
//! `<provider>-pull_request`), `repo` and `branch`, plus `base_branch` for
//! pull requests. Events that start nothing are answered with 204.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use hmac::{Hmac, Mac};
use kraken_core::persistence::ProjectRecord;
use serde_json::{Value, json};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{info, warn};

use crate::broker::Task;
use crate::context::ServerContext;
use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Webhook route group, mounted under `/webhooks`.
pub fn routes() -> Router<ServerContext> {
    Router::new()
        .route("/webhooks/{project_id}/github", post(github))
        .route("/webhooks/{project_id}/gitea", post(gitea))
        .route("/webhooks/{project_id}/gitlab", post(gitlab))
        .route("/webhooks/{project_id}/radicle", post(radicle))
}

/// How a provider proves the request comes from the configured repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    /// `X-Hub-Signature: sha1=<hex>`; an unset secret skips the check.
    HubSha1,
    /// Like `HubSha1` but hooks without a configured secret are ignored.
    HubSha1Required,
    /// `X-Gitlab-Token` equal to the secret.
    Token,
    /// `X-Radicle-Signature: sha256=<hex>`.
    Sha256,
}

struct Provider {
    name: &'static str,
    event_header: &'static str,
    events: &'static [&'static str],
    auth: Auth,
    extract: fn(&str, &Value) -> Option<Value>,
}

const GITHUB: Provider = Provider {
    name: "github",
    event_header: "X-GitHub-Event",
    events: &["push", "pull_request"],
    auth: Auth::HubSha1,
    extract: github_trigger,
};

const GITEA: Provider = Provider {
    name: "gitea",
    event_header: "X-Gitea-Event",
    events: &["push", "pull_request"],
    auth: Auth::HubSha1Required,
    extract: gitea_trigger,
};

const GITLAB: Provider = Provider {
    name: "gitlab",
    event_header: "X-Gitlab-Event",
    events: &["Push Hook", "Merge Request Hook"],
    auth: Auth::Token,
    extract: gitlab_trigger,
};

const RADICLE: Provider = Provider {
    name: "radicle",
    event_header: "X-Radicle-Event-Type",
    events: &["push", "patch"],
    auth: Auth::Sha256,
    extract: radicle_trigger,
};

async fn github(
    State(ctx): State<ServerContext>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    handle(&ctx, &GITHUB, project_id, &headers, &body).await
}

async fn gitea(
    State(ctx): State<ServerContext>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    handle(&ctx, &GITEA, project_id, &headers, &body).await
}

async fn gitlab(
    State(ctx): State<ServerContext>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    handle(&ctx, &GITLAB, project_id, &headers, &body).await
}

async fn radicle(
    State(ctx): State<ServerContext>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    handle(&ctx, &RADICLE, project_id, &headers, &body).await
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle(
    ctx: &ServerContext,
    provider: &Provider,
    project_id: i64,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode> {
    let Some(event) = header(headers, provider.event_header) else {
        warn!(project_id, provider = provider.name, "Missing event type in request header");
        return Err(Error::InvalidRequest(format!(
            "missing {} event type in request header",
            provider.name
        )));
    };
    info!(project_id, provider = provider.name, event, "Webhook received");
    if !provider.events.contains(&event) {
        info!(project_id, provider = provider.name, event, "Unsupported webhook event");
        return Ok(StatusCode::NO_CONTENT);
    }

    let project = ctx
        .persistence
        .get_project(project_id)
        .await?
        .ok_or_else(|| Error::InvalidRequest("Invalid project id".to_string()))?;
    let settings = &project.webhooks;
    if !settings
        .get(format!("{}_enabled", provider.name))
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        info!(project_id, provider = provider.name, "Webhooks disabled for project");
        return Err(Error::InvalidRequest(format!(
            "webhooks from {} disabled",
            provider.name
        )));
    }

    if !authenticate(provider, &project, headers, body)? {
        return Ok(StatusCode::NO_CONTENT);
    }

    let payload: Value = serde_json::from_slice(body)?;
    let Some(trigger) = (provider.extract)(event, &payload) else {
        info!(project_id, provider = provider.name, event, "Webhook event ignored");
        return Ok(StatusCode::NO_CONTENT);
    };

    ctx.broker
        .enqueue(Task::TriggerFlow {
            project_id,
            trigger,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Verify the request. `Ok(false)` means the hook is silently ignored.
fn authenticate(
    provider: &Provider,
    project: &ProjectRecord,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<bool> {
    let secret = project
        .webhooks
        .get(format!("{}_secret", provider.name))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let Some(secret) = secret else {
        return match provider.auth {
            Auth::HubSha1 => Ok(true),
            _ => {
                warn!(project_id = project.id, provider = provider.name, "Webhook secret not configured");
                Ok(false)
            }
        };
    };

    let valid = match provider.auth {
        Auth::HubSha1 | Auth::HubSha1Required => header(headers, "X-Hub-Signature")
            .is_some_and(|sig| verify_signature::<HmacSha1>(secret, body, sig, "sha1")),
        Auth::Sha256 => header(headers, "X-Radicle-Signature")
            .is_some_and(|sig| verify_signature::<HmacSha256>(secret, body, sig, "sha256")),
        Auth::Token => header(headers, "X-Gitlab-Token").is_some_and(|token| token == secret),
    };
    if !valid {
        warn!(project_id = project.id, provider = provider.name, "Bad webhook signature");
        return Err(Error::InvalidRequest("Invalid signature".to_string()));
    }
    Ok(true)
}

/// Check a `<algo>=<hex digest>` header against the HMAC of `body`.
fn verify_signature<M: Mac + hmac::digest::KeyInit>(
    secret: &str,
    body: &[u8],
    header: &str,
    algo: &str,
) -> bool {
    let Some((prefix, digest)) = header.split_once('=') else {
        return false;
    };
    if prefix != algo {
        return false;
    }
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = <M as hmac::digest::KeyInit>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn branch_of_ref(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

fn str_at<'a>(v: &'a Value, pointer: &str) -> Option<&'a str> {
    v.pointer(pointer).and_then(Value::as_str)
}

/// Push trigger shared by GitHub, Gitea and Radicle payloads.
fn push_trigger(provider: &str, req: &Value) -> Option<Value> {
    let git_ref = str_at(req, "/ref")?;
    Some(json!({
        "trigger": format!("{}-push", provider),
        "ref": git_ref,
        "branch": branch_of_ref(git_ref),
        "before": req.get("before").cloned().unwrap_or(Value::Null),
        "after": req.get("after").cloned().unwrap_or(Value::Null),
        "repo": str_at(req, "/repository/clone_url")?,
        "pusher": req.get("pusher").cloned().unwrap_or(Value::Null),
        "commits": req.get("commits").cloned().unwrap_or_else(|| json!([])),
    }))
}

fn pull_request_trigger(provider: &str, req: &Value, before: &str, after: &str) -> Option<Value> {
    let pr = req.get("pull_request")?;
    Some(json!({
        "trigger": format!("{}-pull_request", provider),
        "action": str_at(req, "/action")?,
        "pull_request": pr,
        "branch": str_at(pr, "/head/ref").unwrap_or_default(),
        "base_branch": str_at(pr, "/base/ref")?,
        "before": before,
        "after": after,
        "repo": str_at(req, "/repository/clone_url")?,
        "sender": req.get("sender").cloned().unwrap_or(Value::Null),
    }))
}

/// Trigger for a GitHub event; `None` when the event starts nothing.
pub fn github_trigger(event: &str, req: &Value) -> Option<Value> {
    match event {
        "push" => push_trigger("github", req),
        "pull_request" => {
            let action = str_at(req, "/action")?;
            if action != "opened" && action != "synchronize" {
                return None;
            }
            if action == "opened" && req.pointer("/pull_request/commits").and_then(Value::as_i64) == Some(0) {
                return None;
            }
            let before = str_at(req, "/before").or_else(|| str_at(req, "/pull_request/base/sha"))?;
            let after = str_at(req, "/after").or_else(|| str_at(req, "/pull_request/head/sha"))?;
            pull_request_trigger("github", req, before, after)
        }
        _ => None,
    }
}

/// Trigger for a Gitea event; pull requests without new commits are dropped.
pub fn gitea_trigger(event: &str, req: &Value) -> Option<Value> {
    match event {
        "push" => push_trigger("gitea", req),
        "pull_request" => {
            let action = str_at(req, "/action")?;
            if !["opened", "synchronize", "synchronized"].contains(&action) {
                return None;
            }
            let (before, after) = match (str_at(req, "/before"), str_at(req, "/after")) {
                (Some(b), Some(a)) => (b, a),
                _ => (
                    str_at(req, "/pull_request/base/sha")?,
                    str_at(req, "/pull_request/head/sha")?,
                ),
            };
            if before == after {
                return None;
            }
            pull_request_trigger("gitea", req, before, after)
        }
        _ => None,
    }
}

/// Trigger for a GitLab event (`Push Hook`, `Merge Request Hook`).
pub fn gitlab_trigger(event: &str, req: &Value) -> Option<Value> {
    match event {
        "Push Hook" => {
            let git_ref = str_at(req, "/ref")?;
            Some(json!({
                "trigger": "gitlab-push",
                "ref": git_ref,
                "branch": branch_of_ref(git_ref),
                "before": str_at(req, "/before"),
                "after": str_at(req, "/after"),
                "repo": str_at(req, "/project/git_http_url")?,
                "pusher": {"name": str_at(req, "/user_username")},
                "commits": req.get("commits").cloned().unwrap_or_else(|| json!([])),
            }))
        }
        "Merge Request Hook" => {
            let attrs = req.get("object_attributes")?;
            let action = str_at(attrs, "/action")?;
            if action != "open" && action != "update" {
                return None;
            }
            let after = str_at(attrs, "/last_commit/id")?;
            let before = str_at(attrs, "/oldrev").unwrap_or(after);
            if action == "update" && before == after {
                return None;
            }
            Some(json!({
                "trigger": "gitlab-pull_request",
                "action": action,
                "pull_request": attrs,
                "branch": str_at(attrs, "/source_branch")?,
                "base_branch": str_at(attrs, "/target_branch")?,
                "before": before,
                "after": after,
                "repo": str_at(req, "/project/git_http_url")?,
                "sender": req.get("user").cloned().unwrap_or(Value::Null),
            }))
        }
        _ => None,
    }
}

/// Trigger for a Radicle node event (`push`, `patch`).
pub fn radicle_trigger(event: &str, req: &Value) -> Option<Value> {
    match event {
        "push" => {
            let git_ref = str_at(req, "/ref")?;
            Some(json!({
                "trigger": "radicle-push",
                "ref": git_ref,
                "branch": branch_of_ref(git_ref),
                "before": str_at(req, "/before"),
                "after": str_at(req, "/after"),
                "repo": str_at(req, "/repository/url")?,
                "pusher": req.get("author").cloned().unwrap_or(Value::Null),
                "commits": req.get("commits").cloned().unwrap_or_else(|| json!([])),
            }))
        }
        "patch" => {
            let patch = req.get("patch")?;
            let action = str_at(req, "/action")?;
            if action != "created" && action != "updated" {
                return None;
            }
            Some(json!({
                "trigger": "radicle-pull_request",
                "action": action,
                "pull_request": patch,
                "branch": str_at(patch, "/id").unwrap_or_default(),
                "base_branch": str_at(patch, "/target")?,
                "before": str_at(patch, "/base"),
                "after": str_at(patch, "/head")?,
                "repo": str_at(req, "/repository/url")?,
                "sender": patch.get("author").cloned().unwrap_or(Value::Null),
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::test_context;
    use axum::body::Body;
    use axum::http::Request;
    use kraken_core::model::TaskState;
    use kraken_core::persistence::NewProject;
    use tower::ServiceExt;

    fn push_payload() -> Value {
        json!({
            "ref": "refs/heads/main",
            "before": "000",
            "after": "abc",
            "repository": {"clone_url": "https://github.com/Kraken-CI/kraken.git"},
            "pusher": {"name": "jane"},
            "commits": [{"id": "abc"}]
        })
    }

    fn sign_sha1(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn sign_sha256(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_github_push_trigger() {
        let t = github_trigger("push", &push_payload()).unwrap();
        assert_eq!(t["trigger"], "github-push");
        assert_eq!(t["branch"], "main");
        assert_eq!(t["after"], "abc");
        assert_eq!(t["repo"], "https://github.com/Kraken-CI/kraken.git");
    }

    #[test]
    fn test_github_pull_request_trigger() {
        let mut req = json!({
            "action": "opened",
            "pull_request": {
                "commits": 2,
                "base": {"ref": "main", "sha": "b1"},
                "head": {"ref": "feature", "sha": "h1"}
            },
            "repository": {"clone_url": "https://github.com/Kraken-CI/kraken.git"},
            "sender": {"login": "jane"}
        });
        let t = github_trigger("pull_request", &req).unwrap();
        assert_eq!(t["trigger"], "github-pull_request");
        assert_eq!(t["base_branch"], "main");
        assert_eq!(t["before"], "b1");
        assert_eq!(t["after"], "h1");

        req["pull_request"]["commits"] = json!(0);
        assert!(github_trigger("pull_request", &req).is_none());
        req["action"] = json!("closed");
        assert!(github_trigger("pull_request", &req).is_none());
        assert!(github_trigger("issues", &req).is_none());
    }

    #[test]
    fn test_gitea_drops_pull_request_without_commits() {
        let req = json!({
            "action": "synchronized",
            "before": "x1",
            "after": "x1",
            "pull_request": {"base": {"ref": "main"}, "head": {"ref": "f"}},
            "repository": {"clone_url": "https://gitea.local/org/repo.git"}
        });
        assert!(gitea_trigger("pull_request", &req).is_none());
    }

    #[test]
    fn test_gitlab_merge_request_trigger() {
        let req = json!({
            "object_kind": "merge_request",
            "object_attributes": {
                "action": "open",
                "source_branch": "feature",
                "target_branch": "main",
                "last_commit": {"id": "c2"}
            },
            "project": {"git_http_url": "https://gitlab.com/org/repo.git"}
        });
        let t = gitlab_trigger("Merge Request Hook", &req).unwrap();
        assert_eq!(t["trigger"], "gitlab-pull_request");
        assert_eq!(t["base_branch"], "main");
        assert_eq!(t["after"], "c2");
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"a":1}"#;
        let sig = sign_sha1("s3cr3t", body);
        assert!(verify_signature::<HmacSha1>("s3cr3t", body, &sig, "sha1"));
        assert!(!verify_signature::<HmacSha1>("other", body, &sig, "sha1"));
        assert!(!verify_signature::<HmacSha1>("s3cr3t", body, "sha1", "sha1"));
        assert!(!verify_signature::<HmacSha1>("s3cr3t", body, &sig.replace("sha1", "md5"), "sha1"));
        let sig = sign_sha256("k", body);
        assert!(verify_signature::<HmacSha256>("k", body, &sig, "sha256"));
    }

    async fn post_hook(
        app: Router,
        path: &str,
        headers: &[(&str, String)],
        body: Vec<u8>,
    ) -> StatusCode {
        let mut request = Request::builder().method("POST").uri(path);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = app
            .oneshot(request.body(Body::from(body)).expect("request"))
            .await
            .expect("response");
        response.status()
    }

    #[tokio::test]
    async fn test_github_endpoint_enqueues_trigger() {
        let t = test_context();
        let project = t
            .ctx
            .persistence
            .create_project(&NewProject {
                name: "kraken".into(),
                webhooks: json!({"github_enabled": true, "github_secret": "s3cr3t"}),
                ..Default::default()
            })
            .await
            .unwrap();
        let app = routes().with_state(t.ctx.clone());
        let path = format!("/webhooks/{}/github", project.id);
        let body = serde_json::to_vec(&push_payload()).unwrap();

        let status = post_hook(
            app.clone(),
            &path,
            &[
                ("X-GitHub-Event", "push".into()),
                ("X-Hub-Signature", sign_sha1("s3cr3t", &body)),
            ],
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(t.ctx.persistence.count_tasks(TaskState::Pending).await.unwrap(), 1);

        let status = post_hook(
            app.clone(),
            &path,
            &[
                ("X-GitHub-Event", "push".into()),
                ("X-Hub-Signature", sign_sha1("wrong", &body)),
            ],
            body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let status = post_hook(app, &path, &[("X-GitHub-Event", "issues".into())], body).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(t.ctx.persistence.count_tasks(TaskState::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disabled_or_unknown_project_rejected() {
        let t = test_context();
        let project = t
            .ctx
            .persistence
            .create_project(&NewProject { name: "quiet".into(), ..Default::default() })
            .await
            .unwrap();
        let app = routes().with_state(t.ctx.clone());
        let body = serde_json::to_vec(&push_payload()).unwrap();
        let headers = [("X-GitHub-Event", "push".to_string())];

        let path = format!("/webhooks/{}/github", project.id);
        assert_eq!(post_hook(app.clone(), &path, &headers, body.clone()).await, StatusCode::BAD_REQUEST);
        assert_eq!(
            post_hook(app.clone(), "/webhooks/999/github", &headers, body.clone()).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(post_hook(app, &path, &[], body).await, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_gitlab_token_and_radicle_signature() {
        let t = test_context();
        let project = t
            .ctx
            .persistence
            .create_project(&NewProject {
                name: "multi".into(),
                webhooks: json!({
                    "gitlab_enabled": true, "gitlab_secret": "tok",
                    "radicle_enabled": true, "radicle_secret": "rad"
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        let app = routes().with_state(t.ctx.clone());

        let gitlab_body = serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "before": "1",
            "after": "2",
            "user_username": "jane",
            "project": {"git_http_url": "https://gitlab.com/org/repo.git"}
        }))
        .unwrap();
        let path = format!("/webhooks/{}/gitlab", project.id);
        let status = post_hook(
            app.clone(),
            &path,
            &[("X-Gitlab-Event", "Push Hook".into()), ("X-Gitlab-Token", "bad".into())],
            gitlab_body.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let status = post_hook(
            app.clone(),
            &path,
            &[("X-Gitlab-Event", "Push Hook".into()), ("X-Gitlab-Token", "tok".into())],
            gitlab_body,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let radicle_body = serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "after": "3",
            "repository": {"url": "https://seed.radicle.xyz/z3gq.git"}
        }))
        .unwrap();
        let status = post_hook(
            app,
            &format!("/webhooks/{}/radicle", project.id),
            &[
                ("X-Radicle-Event-Type", "push".into()),
                ("X-Radicle-Signature", sign_sha256("rad", &radicle_body)),
            ],
            radicle_body,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(t.ctx.persistence.count_tasks(TaskState::Pending).await.unwrap(), 2);
    }
}
