// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for kraken-core integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;

use kraken_core::model::{FlowKind, JobState};
use kraken_core::persistence::*;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// Connect to `TEST_DATABASE_URL` and migrate, or `None` when unset.
pub async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    MIGRATOR.run(&pool).await.ok()?;
    Some(pool)
}


macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Ids of a minimal project tree with one queued job.
pub struct Fixture {
    pub branch_id: i64,
    pub stage_id: i64,
    pub flow_id: i64,
    pub run_id: i64,
    pub group_id: i64,
    pub job_id: i64,
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Utc::now().timestamp_nanos_opt().unwrap_or(0))
}

/// Build project, branch, stage, CI flow, run, group and a queued two-step job.
pub async fn seed(p: &dyn Persistence, now: DateTime<Utc>) -> Fixture {
    let project = p
        .create_project(&NewProject {
            name: unique("proj"),
            ..Default::default()
        })
        .await
        .unwrap();
    let branch = p
        .create_branch(&NewBranch {
            project_id: project.id,
            name: "Main".into(),
            branch_name: "main".into(),
        })
        .await
        .unwrap();
    let stage = p
        .create_stage(&NewStage {
            branch_id: branch.id,
            name: "Tests".into(),
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let flow = p
        .create_flow(
            &NewFlow {
                branch_id: branch.id,
                kind: FlowKind::Ci,
                args: json!({}),
                trigger_data: None,
            },
            now,
        )
        .await
        .unwrap();
    let run = p
        .create_run(
            &NewRun {
                flow_id: flow.id,
                stage_id: stage.id,
                args: json!({}),
                reason: json!({"reason": "manual"}),
                repo_data: None,
            },
            now,
        )
        .await
        .unwrap();
    let group = p
        .create_agents_group(&NewAgentsGroup {
            name: unique("group"),
            project_id: Some(project.id),
            deployment: None,
        })
        .await
        .unwrap();
    let step = NewStep {
        tool_id: None,
        fields_raw: json!({"tool": "shell", "cmd": "true"}),
        fields: json!({"tool": "shell", "cmd": "true"}),
        fields_masked: json!({"tool": "shell", "cmd": "true"}),
    };
    let job = p
        .create_job(
            &NewJob {
                run_id: run.id,
                name: "build".into(),
                agents_group_id: Some(group.id),
                system_id: None,
                timeout: 120,
                state: JobState::Queued,
                completion_status: None,
                notes: None,
                steps: vec![step.clone(), step],
            },
            now,
        )
        .await
        .unwrap();

    Fixture {
        branch_id: branch.id,
        stage_id: stage.id,
        flow_id: flow.id,
        run_id: run.id,
        group_id: group.id,
        job_id: job.id,
    }
}

/// Authorized agent in `group_id`.
pub async fn agent_in_group(p: &dyn Persistence, group_id: i64, now: DateTime<Utc>) -> i64 {
    p.create_agent(
        &NewAgent {
            name: unique("agent"),
            address: unique("10.0.0.1"),
            authorized: true,
            agents_group_id: Some(group_id),
            ..Default::default()
        },
        now,
    )
    .await
    .unwrap()
    .id
}
