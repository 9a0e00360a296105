// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs run end to end in the local context with scripted tools.

mod common;

use std::time::Duration;

use common::{Harness, job, read_step_file};
use kraken_protocol::StepState;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, ResponseTemplate};

const RUN_ONLY: &str = r#"
  get_commands) send '{"status": "done", "commands": ["run"]}' ;;
  run) echo "building with hunter2"; send '{"status": "done", "artifact": "app.tar"}' ;;
"#;

#[tokio::test]
async fn test_run_step_reports_progress_then_result() {
    let h = Harness::new().await;
    h.fallback().await;
    h.tool("shell", RUN_ONLY);

    let report = h
        .runner()
        .run_job(job(1, 60, vec![json!({"cmd": "make"})]))
        .await
        .unwrap();

    assert_eq!(report.state_of(0), Some(StepState::Done));
    assert!(!report.cancelled);
    assert_eq!(h.calls(1), vec!["get_commands", "run"]);

    let results = h.step_results().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["result"]["status"], "in-progress");
    assert_eq!(results[1]["result"]["status"], "done");
    assert_eq!(results[1]["result"]["artifact"], "app.tar");
    assert!(results[1]["result"]["duration"].as_u64().unwrap() >= 1);

    let step = read_step_file(&h.job_dir(1), 0);
    assert_eq!(step["cmd"], "make");
    assert_eq!(step["job_id"], 1);
    assert_eq!(step["flow_id"], 2);
    assert_eq!(step["run_id"], 3);
}

#[tokio::test]
async fn test_failed_run_is_retried_then_later_steps_follow_predicates() {
    let h = Harness::new().await;
    h.fallback().await;
    h.tool(
        "shell",
        r#"
  get_commands) send '{"status": "done", "commands": ["run"]}' ;;
  run) if grep -q '"cmd": "fail"' "$STEP"; then exit 3; fi; send '{"status": "done"}' ;;
"#,
    );

    let report = h
        .runner()
        .run_job(job(
            2,
            60,
            vec![
                json!({"cmd": "fail", "attempts": 2, "sleep_time_after_attempt": 0}),
                json!({"cmd": "ok"}),
                json!({"cmd": "ok", "when": "always"}),
                json!({"cmd": "ok", "when": "prev_ok"}),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(report.state_of(0), Some(StepState::Error));
    assert_eq!(report.state_of(1), Some(StepState::Skipped));
    assert_eq!(report.state_of(2), Some(StepState::Done));
    assert_eq!(report.state_of(3), Some(StepState::Done));
    assert_eq!(
        h.calls(2),
        vec!["get_commands", "run", "run", "get_commands", "run", "get_commands", "run"]
    );

    let results = h.step_results().await;
    let failed = results
        .iter()
        .find(|r| r["step_idx"] == 0 && r["result"]["status"] == "error")
        .unwrap();
    assert_eq!(failed["result"]["reason"], "retcode");
    assert_eq!(failed["result"]["retcode"], 3);
    assert!(
        results
            .iter()
            .any(|r| r["step_idx"] == 1 && r["result"]["status"] == "skipped")
    );
}

#[tokio::test]
async fn test_collected_tests_are_dispatched_and_streamed() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"msg": "dispatch-tests", "tests": ["a", "b", "c"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tests": ["a", "c"]})))
        .expect(1)
        .mount(&h.server)
        .await;
    h.fallback().await;
    h.tool(
        "pytest",
        r#"
  get_commands) send '{"status": "done", "commands": ["collect_tests", "run_tests"]}' ;;
  collect_tests) send '{"status": "done", "tests": ["a", "b", "c"]}' ;;
  run_tests) send \
      '{"status": "in-progress", "test-results": [{"test": "a", "status": 1}]}' \
      '{"status": "done", "test-results": [{"test": "c", "status": 1}]}' ;;
"#,
    );

    let report = h
        .runner()
        .run_job(job(3, 60, vec![json!({"tool": "pytest"})]))
        .await
        .unwrap();

    assert_eq!(report.state_of(0), Some(StepState::Done));
    assert_eq!(h.calls(3), vec!["get_commands", "collect_tests", "run_tests"]);
    assert_eq!(read_step_file(&h.job_dir(3), 0)["tests"], json!(["a", "c"]));

    // in-progress marker plus both streamed frames, no extra final report
    let results = h.step_results().await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[1]["result"]["test-results"][0]["test"], "a");
    assert_eq!(results[2]["result"]["status"], "done");
}

#[tokio::test]
async fn test_empty_test_collection_fails_the_step() {
    let h = Harness::new().await;
    h.fallback().await;
    h.tool(
        "pytest",
        r#"
  get_commands) send '{"status": "done", "commands": ["collect_tests", "run_tests"]}' ;;
  collect_tests) send '{"status": "done", "tests": []}' ;;
"#,
    );

    let report = h
        .runner()
        .run_job(job(4, 60, vec![json!({"tool": "pytest"})]))
        .await
        .unwrap();

    assert_eq!(report.state_of(0), Some(StepState::Error));
    let results = h.step_results().await;
    assert_eq!(results.last().unwrap()["result"]["reason"], "no-tests");
    assert!(h.messages("dispatch-tests").await.is_empty());
}

#[tokio::test]
async fn test_tool_without_run_command_is_an_exception() {
    let h = Harness::new().await;
    h.fallback().await;
    h.tool("shell", r#"  get_commands) send '{"status": "done", "commands": ["collect_tests"]}' ;;"#);

    let report = h
        .runner()
        .run_job(job(5, 60, vec![json!({})]))
        .await
        .unwrap();

    assert_eq!(report.state_of(0), Some(StepState::Error));
    let results = h.step_results().await;
    assert_eq!(results.last().unwrap()["result"]["reason"], "exception");
}

#[tokio::test]
async fn test_job_deadline_stops_tool_and_skips_the_rest() {
    let h = Harness::new().await;
    h.fallback().await;
    h.tool(
        "shell",
        r#"
  get_commands) send '{"status": "done", "commands": ["run"]}' ;;
  run) exec sleep 30 ;;
"#,
    );

    let started = std::time::Instant::now();
    let report = h
        .runner()
        .run_job(job(6, 2, vec![json!({}), json!({"when": "always"})]))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(report.state_of(0), Some(StepState::Error));
    assert_eq!(report.state_of(1), Some(StepState::Skipped));
    let results = h.step_results().await;
    let failed = results.iter().find(|r| r["result"]["status"] == "error").unwrap();
    assert_eq!(failed["result"]["reason"], "timeout");
}

#[tokio::test]
async fn test_server_cancel_stops_the_job() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"msg": "step-result"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cancel": true})))
        .mount(&h.server)
        .await;
    h.fallback().await;
    h.tool("shell", RUN_ONLY);

    let report = h
        .runner()
        .run_job(job(7, 60, vec![json!({}), json!({})]))
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(h.calls(7).is_empty());
    assert_eq!(h.step_results().await.len(), 1);
}

#[tokio::test]
async fn test_background_step_runs_until_job_end() {
    let h = Harness::new().await;
    h.fallback().await;
    h.tool(
        "shell",
        r#"
  get_commands) send '{"status": "done", "commands": ["run"]}' ;;
  run) if grep -q '"cmd": "serve"' "$STEP"; then exec sleep 30; fi; send '{"status": "done"}' ;;
"#,
    );

    let started = std::time::Instant::now();
    let report = h
        .runner()
        .run_job(job(
            8,
            60,
            vec![json!({"cmd": "serve", "background": true}), json!({"cmd": "test"})],
        ))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(report.state_of(0), Some(StepState::Done));
    assert_eq!(report.state_of(1), Some(StepState::Done));
}

#[tokio::test]
async fn test_finished_steps_are_not_rerun() {
    let h = Harness::new().await;
    h.fallback().await;
    h.tool("shell", RUN_ONLY);

    let report = h
        .runner()
        .run_job(job(9, 60, vec![json!({"status": "done"}), json!({"when": "prev_ok"})]))
        .await
        .unwrap();

    assert_eq!(report.state_of(0), None);
    assert_eq!(report.state_of(1), Some(StepState::Done));
    assert_eq!(h.calls(9), vec!["get_commands", "run"]);
}
