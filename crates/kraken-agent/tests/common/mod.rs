// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for kraken-agent job tests.
//!
//! Tools are bash scripts named `kraken_<tool>` in a temporary tools
//! directory; they parse `-r`/`-s` like kktool and write frames back through
//! bash's `/dev/tcp`. The server backend is a wiremock server recording
//! every request.

#![allow(dead_code)]

use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kraken_agent::AgentConfig;
use kraken_agent::client::{RetryPolicy, ServerClient};
use kraken_agent::jobber::JobRunner;
use kraken_agent::logship::LogShipper;
use kraken_protocol::JobDescriptor;
use serde_json::{Value, json};
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const PRELUDE: &str = r#"#!/bin/bash
while getopts "m:r:s:" opt; do
  case $opt in
    r) RET=$OPTARG ;;
    s) STEP=$OPTARG ;;
    *) ;;
  esac
done
shift $((OPTIND - 1))
CMD=$1
JOB_DIR=$(dirname "$STEP")
echo "$CMD" >> "$JOB_DIR/calls"
send() {
  exec 3<>"/dev/tcp/${RET%:*}/${RET##*:}"
  for frame in "$@"; do echo "$frame" >&3; done
  exec 3>&-
}
"#;

/// Agent side of a job test: tools dir, data dir and mock backend.
pub struct Harness {
    pub server: MockServer,
    pub tools: tempfile::TempDir,
    pub data: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let server = MockServer::start().await;
        Self {
            server,
            tools: tempfile::tempdir().expect("tools dir"),
            data: tempfile::tempdir().expect("data dir"),
        }
    }

    /// Answer `{}` to everything not mocked more specifically. Call after
    /// the specific mocks.
    pub async fn fallback(&self) {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&self.server)
            .await;
    }

    /// Install `kraken_<name>` whose commands are handled by `cases`, the
    /// body of a bash `case "$CMD" in ... esac`.
    pub fn tool(&self, name: &str, cases: &str) -> PathBuf {
        let path = self.tools.path().join(format!("kraken_{}", name));
        let script = format!("{}case \"$CMD\" in\n{}\nesac\n", PRELUDE, cases);
        std::fs::write(&path, script).expect("write tool");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    pub fn runner(&self) -> JobRunner {
        let mut config = AgentConfig::new(self.server.uri());
        config.data_dir = self.data.path().to_path_buf();
        config.tools_dirs = vec![self.tools.path().to_path_buf()];
        config.keep_alive_interval = Duration::from_secs(3600);
        let client = ServerClient::new(&self.server.uri(), "127.0.0.1")
            .expect("client")
            .with_retry(RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            });
        JobRunner::new(client, config, LogShipper::new(), IpAddr::from([127, 0, 0, 1]))
    }

    pub fn job_dir(&self, job_id: i64) -> PathBuf {
        self.data.path().join("jobs").join(job_id.to_string())
    }

    /// Tool commands invoked for a job, in order.
    pub fn calls(&self, job_id: i64) -> Vec<String> {
        std::fs::read_to_string(self.job_dir(job_id).join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Bodies of the `step-result` messages the backend received.
    pub async fn step_results(&self) -> Vec<Value> {
        self.messages("step-result").await
    }

    pub async fn messages(&self, kind: &str) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .expect("recording enabled")
            .iter()
            .filter_map(|r| r.body_json::<Value>().ok())
            .filter(|body| body["msg"] == kind)
            .collect()
    }
}

/// Local job running `steps` with the `shell` tool unless a step says otherwise.
pub fn job(id: i64, timeout: i64, steps: Vec<Value>) -> JobDescriptor {
    let steps: Vec<Value> = steps
        .into_iter()
        .enumerate()
        .map(|(idx, mut step)| {
            let obj = step.as_object_mut().expect("step object");
            obj.entry("id").or_insert(json!(100 + idx));
            obj.entry("index").or_insert(json!(idx));
            obj.entry("tool").or_insert(json!("shell"));
            obj.entry("status").or_insert(json!("not-started"));
            step
        })
        .collect();
    serde_json::from_value(json!({
        "id": id, "name": "test", "timeout": timeout, "executor": "local",
        "branch_id": 1, "flow_kind": 0, "flow_id": 2, "run_id": 3,
        "steps": steps, "secrets": ["hunter2"]
    }))
    .expect("job descriptor")
}

pub fn read_step_file(dir: &Path, idx: i32) -> Value {
    let text = std::fs::read_to_string(dir.join(format!("step_{}.json", idx))).expect("step file");
    serde_json::from_str(&text).expect("step json")
}
