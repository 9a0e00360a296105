// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later

use super::*;
use crate::context::testing::{TestContext, test_context};
use kraken_core::model::{CompletionStatus, IssueType, JobState, ResultChange, TaskState};
use kraken_core::persistence::{
    JobRecord, NewAgentsGroup, NewBranch, NewFlow, NewIssue, NewJob, NewProject, NewRun,
    NewStage, NewTestResult,
};
use serde_json::json;

struct Fixture {
    t: TestContext,
    branch_id: i64,
    stage_id: i64,
    group_id: i64,
    system_id: i64,
}

async fn setup() -> Fixture {
    let t = test_context();
    let p = t.ctx.persistence.clone();
    let project = p
        .create_project(&NewProject { name: "kraken".into(), ..Default::default() })
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
            name: "tests".into(),
            enabled: true,
            schema: json!({"parent": "root", "jobs": []}),
            ..Default::default()
        })
        .await
        .unwrap();
    let group = p
        .create_agents_group(&NewAgentsGroup { name: "all".into(), ..Default::default() })
        .await
        .unwrap();
    let system = p.ensure_system("ubuntu-22.04", "local").await.unwrap();
    Fixture {
        t,
        branch_id: branch.id,
        stage_id: stage.id,
        group_id: group.id,
        system_id: system.id,
    }
}

impl Fixture {
    /// A flow `hours_ago` old with one run of the stage.
    async fn run(&self, kind: FlowKind, hours_ago: i64, completed: bool) -> RunRecord {
        let p = &self.t.ctx.persistence;
        let at = Utc::now() - chrono::Duration::hours(hours_ago);
        let flow = p
            .create_flow(
                &NewFlow { branch_id: self.branch_id, kind, args: json!({}), trigger_data: None },
                at,
            )
            .await
            .unwrap();
        let run = p
            .create_run(
                &NewRun {
                    flow_id: flow.id,
                    stage_id: self.stage_id,
                    args: json!({}),
                    reason: json!({"reason": "test"}),
                    repo_data: None,
                },
                at,
            )
            .await
            .unwrap();
        p.update_run_start(run.id, &json!({}), None, RunState::InProgress, Some(at))
            .await
            .unwrap();
        if completed {
            p.complete_run(run.id, None, at).await.unwrap();
        }
        p.get_run(run.id).await.unwrap().unwrap()
    }

    async fn job(&self, run: &RunRecord, status: CompletionStatus) -> JobRecord {
        self.t
            .ctx
            .persistence
            .create_job(
                &NewJob {
                    run_id: run.id,
                    name: "unit".into(),
                    agents_group_id: Some(self.group_id),
                    system_id: Some(self.system_id),
                    timeout: 300,
                    state: JobState::Completed,
                    completion_status: Some(status),
                    notes: None,
                    steps: Vec::new(),
                },
                Utc::now(),
            )
            .await
            .unwrap()
    }

    async fn results(&self, job: &JobRecord, results: &[(&str, TcResult)]) {
        let results: Vec<NewTestResult> = results
            .iter()
            .map(|(name, result)| NewTestResult {
                test_name: name.to_string(),
                result: *result,
                cmd_line: None,
                values: None,
            })
            .collect();
        self.t
            .ctx
            .persistence
            .record_test_results(job.id, None, &results)
            .await
            .unwrap();
    }

    async fn issue(&self, job: &JobRecord, line: i32, symbol: &str) {
        let issue = NewIssue {
            issue_type: IssueType::Warning,
            line,
            col: 1,
            path: "src/app.py".into(),
            symbol: symbol.into(),
            message: "lint".into(),
            extra: json!({}),
        };
        self.t.ctx.persistence.record_issues(job.id, &[issue]).await.unwrap();
    }
}

#[tokio::test]
async fn test_analyze_run_counts_non_covered_jobs() {
    let f = setup().await;
    let p = f.t.ctx.persistence.clone();
    let run = f.run(FlowKind::Ci, 1, true).await;
    let ok = f.job(&run, CompletionStatus::AllOk).await;
    f.results(&ok, &[("t1", TcResult::Passed), ("t2", TcResult::NotRun)]).await;
    f.issue(&ok, 10, "unused").await;
    let covered = f.job(&run, CompletionStatus::AgentErrorReturned).await;
    p.cover_jobs(&[covered.id]).await.unwrap();
    f.job(&run, CompletionStatus::StepTimeout).await;

    let counters = analyze_run(&f.t.ctx, run.id).await.unwrap();
    assert_eq!(
        counters,
        RunCounters {
            tests_total: 2,
            tests_passed: 1,
            tests_not_run: 1,
            jobs_total: 2,
            jobs_error: 1,
            issues_total: 1,
        }
    );
    let stored = p.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.jobs_error, 1);
    let flow = p.get_flow(run.flow_id).await.unwrap().unwrap();
    assert_eq!(flow.state, FlowState::Completed);

    let summary = completed_flow_summary(&f.t.ctx, f.branch_id, FlowKind::Ci)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.flow_id, flow.id);
    assert_eq!(summary.runs_errored, 1);
    assert_eq!(summary.tests_passed, 1);
    assert!(p.count_tasks(TaskState::Pending).await.unwrap() >= 1);
}

#[tokio::test]
async fn test_flow_stays_open_while_a_run_is_in_progress() {
    let f = setup().await;
    let p = f.t.ctx.persistence.clone();
    let run = f.run(FlowKind::Ci, 1, true).await;
    p.create_run(
        &NewRun {
            flow_id: run.flow_id,
            stage_id: f.stage_id,
            args: json!({}),
            reason: json!({}),
            repo_data: None,
        },
        Utc::now(),
    )
    .await
    .unwrap();
    analyze_run(&f.t.ctx, run.id).await.unwrap();
    let flow = p.get_flow(run.flow_id).await.unwrap().unwrap();
    assert_eq!(flow.state, FlowState::InProgress);
}

#[tokio::test]
async fn test_pass_fail_pass_history() {
    let f = setup().await;
    let p = f.t.ctx.persistence.clone();
    let mut runs = Vec::new();
    for (hours_ago, result) in [(3, TcResult::Passed), (2, TcResult::Failed), (1, TcResult::Passed)] {
        let run = f.run(FlowKind::Ci, hours_ago, true).await;
        let job = f.job(&run, CompletionStatus::AllOk).await;
        f.results(&job, &[("T", result)]).await;
        runs.push((run, job));
    }

    let first = analyze_results_history(&f.t.ctx, runs[0].0.id).await.unwrap().unwrap();
    assert_eq!(first.new_cnt, 1);
    let second = analyze_results_history(&f.t.ctx, runs[1].0.id).await.unwrap().unwrap();
    assert_eq!(second.regr_cnt, 1);
    let third = analyze_results_history(&f.t.ctx, runs[2].0.id).await.unwrap().unwrap();
    assert_eq!(third.fix_cnt, 1);

    let result = &p.list_job_results(runs[2].1.id).await.unwrap()[0];
    assert_eq!(result.change, ResultChange::Fix);
    assert_eq!(result.age, 0);
    assert!(result.instability >= 2);
    let run = p.get_run(runs[2].0.id).await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Processed);
    assert_eq!(run.fix_cnt, 1);

    // replaying yields the same analysis
    analyze_results_history(&f.t.ctx, runs[2].0.id).await.unwrap();
    let again = &p.list_job_results(runs[2].1.id).await.unwrap()[0];
    assert_eq!((again.change, again.age, again.instability), (result.change, result.age, result.instability));
}

#[tokio::test]
async fn test_stable_results_age() {
    let f = setup().await;
    let p = f.t.ctx.persistence.clone();
    let mut last_job = None;
    for hours_ago in [3, 2, 1] {
        let run = f.run(FlowKind::Ci, hours_ago, true).await;
        let job = f.job(&run, CompletionStatus::AllOk).await;
        f.results(&job, &[("T", TcResult::Passed)]).await;
        analyze_results_history(&f.t.ctx, run.id).await.unwrap();
        last_job = Some(job);
    }
    let result = &p.list_job_results(last_job.unwrap().id).await.unwrap()[0];
    assert_eq!(result.change, ResultChange::No);
    assert_eq!(result.age, 2);
    assert_eq!(result.instability, 0);
}

#[tokio::test]
async fn test_history_postponed_while_previous_run_in_progress() {
    let f = setup().await;
    let p = f.t.ctx.persistence.clone();
    f.run(FlowKind::Ci, 2, false).await;
    let run = f.run(FlowKind::Ci, 1, true).await;
    let before = p.count_tasks(TaskState::Pending).await.unwrap();

    assert!(analyze_results_history(&f.t.ctx, run.id).await.unwrap().is_none());
    assert_eq!(p.get_run(run.id).await.unwrap().unwrap().state, RunState::Completed);
    assert_eq!(p.count_tasks(TaskState::Pending).await.unwrap(), before + 1);
}

#[tokio::test]
async fn test_dev_flow_compares_with_ci() {
    let f = setup().await;
    let p = f.t.ctx.persistence.clone();
    let ci = f.run(FlowKind::Ci, 2, true).await;
    let ci_job = f.job(&ci, CompletionStatus::AllOk).await;
    f.results(&ci_job, &[("T", TcResult::Passed)]).await;

    let dev = f.run(FlowKind::Dev, 1, true).await;
    let dev_job = f.job(&dev, CompletionStatus::AgentErrorReturned).await;
    f.results(&dev_job, &[("T", TcResult::Failed), ("U", TcResult::Passed)]).await;

    let counters = analyze_results_history(&f.t.ctx, dev.id).await.unwrap().unwrap();
    assert_eq!(counters.regr_cnt, 1);
    assert_eq!(counters.new_cnt, 1);
    let results = p.list_job_results(dev_job.id).await.unwrap();
    assert_eq!(results[0].change, ResultChange::Regression);
    assert_eq!(results[1].change, ResultChange::New);
}

#[tokio::test]
async fn test_issue_ages_follow_previous_job() {
    let f = setup().await;
    let p = f.t.ctx.persistence.clone();
    let old = f.run(FlowKind::Ci, 2, true).await;
    let old_job = f.job(&old, CompletionStatus::AllOk).await;
    f.issue(&old_job, 10, "unused").await;
    analyze_results_history(&f.t.ctx, old.id).await.unwrap();
    assert_eq!(p.list_job_issues(old_job.id).await.unwrap()[0].age, 0);

    let run = f.run(FlowKind::Ci, 1, true).await;
    let job = f.job(&run, CompletionStatus::AllOk).await;
    f.issue(&job, 12, "unused").await;
    f.issue(&job, 40, "shadowed").await;
    let counters = analyze_results_history(&f.t.ctx, run.id).await.unwrap().unwrap();
    assert_eq!(counters.issues_new, 1);
    let issues = p.list_job_issues(job.id).await.unwrap();
    assert_eq!(issues[0].age, 1);
    assert_eq!(issues[1].age, 0);
}

#[tokio::test]
async fn test_notify_writes_log_row() {
    let f = setup().await;
    let run = f.run(FlowKind::Ci, 1, true).await;
    notify_about_run(&f.t.ctx, run.id, "end").await.unwrap();
    let rows = f.t.logs.rows(LogTable::Logs).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].run, run.id as u64);
    assert!(rows[0].message.contains("finished"));
}

#[test]
fn test_summary_keys() {
    assert_eq!(summary_key(7, FlowKind::Ci), "7-ci");
    assert_eq!(completed_summary_key(7, FlowKind::Dev), "7-dev-completed");
}
