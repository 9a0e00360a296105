// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for kraken-server end-to-end tests.
//!
//! Everything runs against the in-memory persistence and log store; broker
//! tasks are drained inline so each test controls when background work
//! happens.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::Utc;
use http_body_util::BodyExt;
use kraken_core::logstore::MemoryLogStore;
use kraken_core::persistence::{
    MemoryPersistence, NewAgent, NewAgentsGroup, NewBranch, NewProject, NewStage, NewTool,
    Persistence,
};
use kraken_protocol::messages::{AgentMessage, AgentRequest, AgentResponse};
use kraken_server::broker;
use kraken_server::cloud::ProviderRegistry;
use kraken_server::cloud::fleet::{FleetConfig, FleetManager};
use kraken_server::context::{ServerContext, ServerSettings};
use kraken_server::objstore::ObjectStore;
use kraken_server::server;
use kraken_server::tasks::TaskDispatcher;
use serde_json::{Value, json};
use tower::ServiceExt;

pub const AGENT_ADDRESS: &str = "10.20.0.1";

/// Server context over in-memory backends plus a seeded project.
pub struct TestServer {
    pub ctx: ServerContext,
    pub db: Arc<MemoryPersistence>,
    pub logs: Arc<MemoryLogStore>,
    pub project_id: i64,
    pub branch_id: i64,
    pub agent_id: i64,
    _dir: tempfile::TempDir,
}

impl TestServer {
    /// Project `kraken` with GitHub webhooks enabled, branch `main`, one
    /// authorized agent and a `build` stage running `cmd` with the shell tool.
    pub async fn new(cmd: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(MemoryPersistence::new());
        let logs = Arc::new(MemoryLogStore::new());
        let settings = ServerSettings {
            server_url: "http://kraken.test".to_string(),
            ..ServerSettings::default()
        };
        let fleet = FleetManager::new(
            db.clone(),
            Arc::new(ProviderRegistry::new()),
            FleetConfig {
                server_url: settings.server_url.clone(),
                ..FleetConfig::default()
            },
        );
        let ctx = ServerContext::new(
            db.clone(),
            Arc::new(ObjectStore::new(dir.path())),
            logs.clone(),
            Arc::new(fleet),
            settings,
        );

        let project = db
            .create_project(&NewProject {
                name: "kraken".into(),
                webhooks: json!({"github_enabled": true}),
                ..Default::default()
            })
            .await
            .expect("project");
        let branch = db
            .create_branch(&NewBranch {
                project_id: project.id,
                name: "Main".into(),
                branch_name: "main".into(),
            })
            .await
            .expect("branch");
        let group = db
            .create_agents_group(&NewAgentsGroup {
                name: "all".into(),
                ..Default::default()
            })
            .await
            .expect("group");
        let agent = db
            .create_agent(
                &NewAgent {
                    name: "agent-1".into(),
                    address: AGENT_ADDRESS.into(),
                    authorized: true,
                    agents_group_id: Some(group.id),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .expect("agent");
        db.create_tool(&NewTool {
            name: "shell".into(),
            version: "1.0.0".into(),
            fields_schema: json!({"type": "object", "required": ["cmd"]}),
            entry: "shell".into(),
            ..Default::default()
        })
        .await
        .expect("tool");

        let schema = json!({
            "parent": "root",
            "triggers": {"parent": true},
            "jobs": [{
                "name": "unit",
                "steps": [{"tool": "shell", "cmd": cmd}],
                "environments": [{"system": "ubuntu-22.04", "agents_group": "all"}]
            }]
        });
        db.create_stage(&NewStage {
            branch_id: branch.id,
            name: "build".into(),
            enabled: true,
            schema_code: schema.to_string(),
            schema,
            ..Default::default()
        })
        .await
        .expect("stage");

        Self {
            ctx,
            db,
            logs,
            project_id: project.id,
            branch_id: branch.id,
            agent_id: agent.id,
            _dir: dir,
        }
    }

    pub fn router(&self) -> Router {
        server::router(self.ctx.clone())
    }

    /// Run every due broker task inline, including tasks they enqueue.
    ///
    /// Returns the number of tasks executed.
    pub async fn drain_tasks(&self) -> usize {
        let handler = TaskDispatcher::new(self.ctx.clone());
        let mut executed = 0;
        for _ in 0..50 {
            let claimed = self.db.claim_tasks(16, Utc::now()).await.expect("claim");
            if claimed.is_empty() {
                break;
            }
            for record in claimed {
                broker::execute(self.db.as_ref(), &handler, record).await;
                executed += 1;
            }
        }
        executed
    }

    /// Send one agent message through the HTTP backend.
    pub async fn agent(&self, message: AgentMessage) -> AgentResponse {
        let request = AgentRequest::new(AGENT_ADDRESS, message);
        let (status, body) = send(
            self.router(),
            Request::builder()
                .method("POST")
                .uri("/backend")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&request).expect("encode")))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "backend answered {}: {:?}", status, body);
        serde_json::from_slice(&body).expect("agent response")
    }
}

/// Send a request, returning status and raw body.
pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, bytes::Bytes) {
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, body)
}

/// GitHub push payload for `refs/heads/{branch}`.
pub fn github_push(branch: &str, commit: &str) -> Value {
    json!({
        "ref": format!("refs/heads/{}", branch),
        "before": "0000000000000000000000000000000000000000",
        "after": commit,
        "repository": {"clone_url": "https://github.com/Kraken-CI/kraken.git"},
        "pusher": {"name": "godfryd", "email": "godfryd@example.com"},
        "commits": [{"id": commit, "message": "fix scheduler"}]
    })
}
