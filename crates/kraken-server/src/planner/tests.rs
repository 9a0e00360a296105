// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later

use super::*;
use crate::context::testing::{TestContext, test_context};
use kraken_core::model::TaskState;
use kraken_core::persistence::{
    NewAgent, NewAgentsGroup, NewBranch, NewProject, NewSecret, NewStage, NewTool, Persistence,
};

struct Setup {
    t: TestContext,
    project_id: i64,
    branch_id: i64,
}

async fn setup() -> Setup {
    let t = test_context();
    let db = &t.db;
    let project = db
        .create_project(&NewProject {
            name: "kraken".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let branch = db
        .create_branch(&NewBranch {
            project_id: project.id,
            name: "Main".into(),
            branch_name: "main".into(),
        })
        .await
        .unwrap();
    let group = db
        .create_agents_group(&NewAgentsGroup {
            name: "all".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    db.create_agent(
        &NewAgent {
            name: "agent-1".into(),
            address: "10.0.0.1".into(),
            authorized: true,
            agents_group_id: Some(group.id),
            ..Default::default()
        },
        Utc::now(),
    )
    .await
    .unwrap();
    db.create_agents_group(&NewAgentsGroup {
        name: "empty".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    db.create_tool(&NewTool {
        name: "shell".into(),
        version: "1.0.0".into(),
        fields_schema: json!({"type": "object", "required": ["cmd"]}),
        entry: "shell".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    Setup {
        t,
        project_id: project.id,
        branch_id: branch.id,
    }
}

fn schema(parent: &str, job: Value) -> Value {
    json!({"parent": parent, "triggers": {"parent": true}, "jobs": [job]})
}

fn shell_job(name: &str, cmd: &str, group: &str) -> Value {
    json!({
        "name": name,
        "steps": [{"tool": "shell", "cmd": cmd}],
        "environments": [{"system": "ubuntu-22.04", "agents_group": group}]
    })
}

async fn add_stage(s: &Setup, name: &str, tree: Value) -> StageRecord {
    s.t.db
        .create_stage(&NewStage {
            branch_id: s.branch_id,
            name: name.into(),
            enabled: true,
            schema_code: tree.to_string(),
            schema: tree,
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn only_run(s: &Setup, flow_id: i64) -> RunRecord {
    let runs = s.t.db.list_flow_runs(flow_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    runs.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_create_flow_starts_root_stage_and_queues_jobs() {
    let s = setup().await;
    add_stage(&s, "build", schema("root", shell_job("make", "make -j #{KK_FLOW_SEQ}", "all"))).await;
    add_stage(&s, "deploy", schema("build", shell_job("ship", "ship", "all"))).await;

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    assert_eq!(flow.args["KK_FLOW_SEQ"], "1");
    assert_eq!(flow.args["KK_CI_DEV_FLOW_SEQ"], "1");
    assert_eq!(flow.args["KK_FLOW_TYPE"], "CI");
    assert_eq!(flow.args["KK_BRANCH"], "main");

    let run = only_run(&s, flow.id).await;
    assert_eq!(run.state, RunState::InProgress);
    assert!(run.started.is_some());
    assert_eq!(run.args["KK_RUN_SEQ"], "1");

    let jobs = s.t.db.list_run_jobs(run.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Queued);
    assert_eq!(jobs[0].timeout, DEFAULT_JOB_TIMEOUT.as_secs() as i32);
    let steps = s.t.db.list_job_steps(jobs[0].id).await.unwrap();
    assert_eq!(steps[0].fields["cmd"], "make -j 1");
    assert_eq!(steps[0].fields["when"], "was_no_error");
    assert!(steps[0].fields.get("tool").is_none());
    assert_eq!(steps[0].fields_raw["cmd"], "make -j #{KK_FLOW_SEQ}");

    let next = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    assert_eq!(next.args["KK_FLOW_SEQ"], "2");
    let dev = create_flow(&s.t.ctx, s.branch_id, FlowKind::Dev, FlowRequest::default())
        .await
        .unwrap();
    assert_eq!(dev.args["KK_FLOW_SEQ"], "3");
    assert_eq!(dev.args["KK_CI_DEV_FLOW_SEQ"], "1");
}

#[tokio::test]
async fn test_missing_tool_completes_job_and_run() {
    let s = setup().await;
    let mut job = shell_job("lint", "x", "all");
    job["steps"] = json!([{"tool": "pylint@9.9"}]);
    add_stage(&s, "lint", schema("root", job)).await;

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let run = only_run(&s, flow.id).await;
    let jobs = s.t.db.list_run_jobs(run.id).await.unwrap();
    assert_eq!(jobs[0].state, JobState::Completed);
    assert_eq!(jobs[0].completion_status, Some(CompletionStatus::MissingToolInDb));
    assert_eq!(
        jobs[0].notes.as_deref(),
        Some("cannot find tool 'pylint@9.9' in database")
    );
    assert_eq!(run.state, RunState::Completed);
}

#[tokio::test]
async fn test_missing_group_and_empty_group() {
    let s = setup().await;
    add_stage(&s, "a", schema("root", shell_job("a", "x", "nope"))).await;
    add_stage(&s, "b", schema("root", shell_job("b", "x", "empty"))).await;

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let mut statuses = Vec::new();
    for run in s.t.db.list_flow_runs(flow.id).await.unwrap() {
        for job in s.t.db.list_run_jobs(run.id).await.unwrap() {
            statuses.push((job.name.clone(), job.completion_status, job.notes.clone()));
        }
    }
    statuses.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(statuses[0].1, Some(CompletionStatus::MissingAgentsGroup));
    assert_eq!(
        statuses[0].2.as_deref(),
        Some("cannot find agents group 'nope' in database")
    );
    assert_eq!(statuses[1].1, Some(CompletionStatus::NoAgents));
    assert_eq!(
        statuses[1].2.as_deref(),
        Some("there are no agents in group 'empty' - add some agents")
    );
}

#[tokio::test]
async fn test_timeouts_learned_and_declared() {
    let s = setup().await;
    let mut job = shell_job("quick", "x", "all");
    job["timeout"] = json!(10);
    let mut tree = schema("root", job);
    tree["jobs"]
        .as_array_mut()
        .unwrap()
        .push(shell_job("learned", "y", "all"));
    let stage = add_stage(&s, "t", tree).await;

    let system = s.t.db.ensure_system("ubuntu-22.04", "local").await.unwrap();
    let group = s.t.db.find_agents_group("all", None).await.unwrap().unwrap();
    let mut timeouts = Map::new();
    timeouts.insert(timeout_key("learned", system.id, group.id), json!(777));
    s.t.db
        .update_stage_timeouts(stage.id, &Value::Object(timeouts))
        .await
        .unwrap();

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let run = only_run(&s, flow.id).await;
    let jobs = s.t.db.list_run_jobs(run.id).await.unwrap();
    let by_name = |n: &str| jobs.iter().find(|j| j.name == n).unwrap().timeout;
    assert_eq!(by_name("quick"), MIN_JOB_TIMEOUT_SECS);
    assert_eq!(by_name("learned"), 777);
}

#[tokio::test]
async fn test_secrets_are_masked_in_stored_fields() {
    let s = setup().await;
    s.t.db
        .create_secret(&NewSecret {
            project_id: s.project_id,
            name: "token".into(),
            kind: SecretKind::Simple,
            data: json!({"secret": "hunter2"}),
        })
        .await
        .unwrap();
    add_stage(
        &s,
        "pub",
        schema("root", shell_job("pub", "push --token #{KK_SECRET_SIMPLE_token}", "all")),
    )
    .await;

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let run = only_run(&s, flow.id).await;
    let job = &s.t.db.list_run_jobs(run.id).await.unwrap()[0];
    let step = &s.t.db.list_job_steps(job.id).await.unwrap()[0];
    assert_eq!(step.fields["cmd"], "push --token hunter2");
    assert_eq!(step.fields_masked["cmd"], "push --token ******");
}

#[tokio::test]
async fn test_manual_stage_waits_for_operator() {
    let s = setup().await;
    let mut tree = schema("root", shell_job("m", "x", "all"));
    tree["triggers"]["manual"] = json!(true);
    add_stage(&s, "manual", tree).await;

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let run = only_run(&s, flow.id).await;
    assert_eq!(run.state, RunState::Manual);
    assert!(s.t.db.list_run_jobs(run.id).await.unwrap().is_empty());

    start_manual_run(&s.t.ctx, run.id, "alice").await.unwrap();
    let run = only_run(&s, flow.id).await;
    assert_eq!(run.state, RunState::InProgress);
    assert_eq!(s.t.db.list_run_jobs(run.id).await.unwrap().len(), 1);
    assert!(start_manual_run(&s.t.ctx, run.id, "alice").await.is_err());
}

#[tokio::test]
async fn test_following_stage_starts_after_clean_run() {
    let s = setup().await;
    add_stage(&s, "build", schema("root", shell_job("make", "make", "all"))).await;
    let deploy = add_stage(&s, "deploy", schema("build", shell_job("ship", "ship", "all"))).await;

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let build_run = only_run(&s, flow.id).await;

    assert_eq!(trigger_following_stages(&s.t.ctx, &build_run).await.unwrap(), 1);
    let deploy_run = s.t.db.find_run(flow.id, deploy.id).await.unwrap().unwrap();
    assert_eq!(deploy_run.reason["reason"], "parent");
    // already started
    assert_eq!(trigger_following_stages(&s.t.ctx, &build_run).await.unwrap(), 0);

    let mut failed = build_run.clone();
    failed.jobs_error = 1;
    assert_eq!(trigger_following_stages(&s.t.ctx, &failed).await.unwrap(), 0);
}

#[tokio::test]
async fn test_replay_covers_previous_jobs() {
    let s = setup().await;
    let stage = add_stage(&s, "build", schema("root", shell_job("make", "make", "all"))).await;
    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let first = only_run(&s, flow.id).await;
    let old_job = s.t.db.list_run_jobs(first.id).await.unwrap()[0].id;

    let replayed = start_run(&s.t.ctx, &stage, &flow, json!({"reason": "manual"}), json!({}))
        .await
        .unwrap();
    assert_eq!(replayed.id, first.id);
    let jobs = s.t.db.list_run_jobs(first.id).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().find(|j| j.id == old_job).unwrap().covered);
    assert!(jobs.iter().any(|j| j.id != old_job && !j.covered));
}

#[tokio::test]
async fn test_broken_schema_completes_run_with_note() {
    let s = setup().await;
    s.t.db
        .create_stage(&NewStage {
            branch_id: s.branch_id,
            name: "broken".into(),
            enabled: true,
            schema_code: "{% if %}".into(),
            schema: json!({"parent": "root"}),
            ..Default::default()
        })
        .await
        .unwrap();

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let run = only_run(&s, flow.id).await;
    assert_eq!(run.state, RunState::Completed);
    assert!(run.note.unwrap().starts_with("Triggering run's jobs failed:"));
    assert!(s.t.db.count_tasks(TaskState::Pending).await.unwrap() >= 1);
}

#[tokio::test]
async fn test_labels_are_substituted() {
    let s = setup().await;
    let mut tree = schema("root", shell_job("make", "make", "all"));
    tree["flow_label"] = json!("flow-#{KK_FLOW_SEQ}");
    tree["run_label"] = json!("run-#{KK_RUN_SEQ}-#{branch_name}");
    add_stage(&s, "build", tree).await;

    let flow = create_flow(&s.t.ctx, s.branch_id, FlowKind::Ci, FlowRequest::default())
        .await
        .unwrap();
    let flow = s.t.db.get_flow(flow.id).await.unwrap().unwrap();
    assert_eq!(flow.label.as_deref(), Some("flow-1"));
    let run = only_run(&s, flow.id).await;
    assert_eq!(run.label.as_deref(), Some("run-1-main"));
}

#[tokio::test]
async fn test_check_stage_schema_reports_missing_tool() {
    let s = setup().await;
    let stage = add_stage(&s, "build", schema("root", shell_job("make", "make", "all"))).await;
    let mut bad = schema("root", shell_job("make", "make", "all"));
    bad["jobs"][0]["steps"] = json!([{"tool": "shell", "cmd": "a"}, {"tool": "gradle"}]);
    let err = check_stage_schema(&s.t.ctx, &stage, &bad.to_string())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("job 1, step 1: tool 'gradle' not found"));
    check_stage_schema(&s.t.ctx, &stage, &stage.schema_code).await.unwrap();
}

#[tokio::test]
async fn test_trigger_run_creates_flow_for_one_stage() {
    let s = setup().await;
    let nightly = add_stage(&s, "nightly", schema("root", shell_job("n", "x", "all"))).await;
    add_stage(&s, "other", schema("root", shell_job("o", "x", "all"))).await;

    let run = trigger_run(&s.t.ctx, nightly.id, FlowKind::Ci, json!({"reason": "cron"}))
        .await
        .unwrap();
    assert_eq!(run.stage_id, nightly.id);
    assert_eq!(s.t.db.list_flow_runs(run.flow_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_webhook_push_creates_ci_flow() {
    let s = setup().await;
    let mut job = shell_job("make", "make", "all");
    job["steps"] = json!([
        {"tool": "shell", "cmd": "true"},
        {"tool": "git", "checkout": "https://github.com/org/repo.git"}
    ]);
    add_stage(&s, "build", schema("root", job)).await;
    s.t.db
        .create_tool(&NewTool {
            name: "git".into(),
            version: "1".into(),
            entry: "git".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let trigger = json!({
        "trigger": "github-push",
        "repo": "git@github.com:org/repo.git",
        "branch": "main"
    });
    trigger_flow(&s.t.ctx, s.project_id, &trigger).await.unwrap();
    let flow = s.t.db.last_flow(s.branch_id, Some(FlowKind::Ci)).await.unwrap().unwrap();
    assert_eq!(flow.trigger_data.as_ref().unwrap()["trigger"], "github-push");

    // the stage already ran in that flow, so the next push opens a new flow
    trigger_flow(&s.t.ctx, s.project_id, &trigger).await.unwrap();
    let next = s.t.db.last_flow(s.branch_id, Some(FlowKind::Ci)).await.unwrap().unwrap();
    assert_ne!(next.id, flow.id);

    let unknown = json!({"trigger": "github-push", "branch": "feature"});
    trigger_flow(&s.t.ctx, s.project_id, &unknown).await.unwrap();
    let pr = json!({"trigger": "gitea-pull_request", "base_branch": "main", "repo": "https://x/y"});
    trigger_flow(&s.t.ctx, s.project_id, &pr).await.unwrap();
    let dev = s.t.db.last_flow(s.branch_id, Some(FlowKind::Dev)).await.unwrap().unwrap();
    assert_eq!(dev.kind, FlowKind::Dev);
}
