// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent ⇄ server messages.
//!
//! Every agent request is one JSON object `{address, msg, ...}` posted to the
//! backend endpoint. Responses are flat JSON objects; absent keys mean "nothing
//! to report", so an empty object is always a valid answer.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Agents sleep this long between polls when no job is assigned.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Agents send keep-alive this often while a step runs.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Unauthorized agents re-report host info after this delay.
pub const UNAUTHORIZED_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Replacement text for secret values in logs and masked fields.
pub const SECRET_MASK: &str = "******";

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Agent address; the server falls back to the peer IP when absent.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(flatten)]
    pub message: AgentMessage,
}

impl AgentRequest {
    pub fn new(address: impl Into<String>, message: AgentMessage) -> Self {
        Self {
            address: Some(address.into()),
            message,
        }
    }
}

/// Message kinds, tagged by the `msg` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case")]
pub enum AgentMessage {
    /// Poll for an assigned job.
    GetJob,
    /// Progress or final result of one step.
    StepResult {
        job_id: i64,
        step_idx: i32,
        result: StepResult,
    },
    /// Tests collected by a tool, to be split across jobs.
    DispatchTests {
        job_id: i64,
        step_idx: i32,
        tests: Vec<String>,
    },
    /// Host description sent once at startup.
    SysInfo { info: HostInfo },
    /// Liveness ping, optionally naming the running job.
    KeepAlive {
        #[serde(default)]
        job_id: Option<i64>,
    },
}

impl AgentMessage {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetJob => "get-job",
            Self::StepResult { .. } => "step-result",
            Self::DispatchTests { .. } => "dispatch-tests",
            Self::SysInfo { .. } => "sys-info",
            Self::KeepAlive { .. } => "keep-alive",
        }
    }
}

/// Flat response object shared by all message kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default, skip_serializing_if = "is_false")]
    pub unauthorized: bool,
    /// The job was completed server-side; stop working on it.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "job_or_empty"
    )]
    pub job: Option<JobDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg: Option<AgentCfg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Seconds left for the current job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    /// Tests kept for this job after dispatching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<i64>,
}

impl AgentResponse {
    pub fn unauthorized() -> Self {
        Self {
            unauthorized: true,
            ..Default::default()
        }
    }

    pub fn cancel() -> Self {
        Self {
            cancel: true,
            ..Default::default()
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// `{}` and `null` both mean "no job".
fn job_or_empty<'de, D>(deserializer: D) -> Result<Option<JobDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        _ => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Configuration pushed from server to agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCfg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clickhouse_addr: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Host description collected by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Declared system name, or a numeric system id given at install time.
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub system_type: String,
    #[serde(default)]
    pub distro_name: String,
    #[serde(default)]
    pub distro_version: String,
    #[serde(default)]
    pub isolation_type: String,
    #[serde(default)]
    pub isolation: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Execution backends available on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub docker: bool,
    #[serde(default)]
    pub lxd: bool,
    #[serde(default)]
    pub k8s: bool,
}

/// Step status as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    NotStarted,
    InProgress,
    Done,
    Error,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Skipped)
    }
}

/// Result object of a step, also the payload of every kktool frame.
///
/// `status` is the only required key; tools attach `reason`, `msg`,
/// `test-results`, `issues`, `tests`, `commands` and arbitrary extras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepState,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl StepResult {
    pub fn new(status: StepState) -> Self {
        Self {
            status,
            data: Map::new(),
        }
    }

    pub fn done() -> Self {
        Self::new(StepState::Done)
    }

    pub fn in_progress() -> Self {
        Self::new(StepState::InProgress)
    }

    /// Error result with a machine-readable reason (`job-timeout`, `exception`, ...).
    pub fn error(reason: &str) -> Self {
        Self::new(StepState::Error).with("reason", reason)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.data.get("reason").and_then(Value::as_str)
    }

    pub fn msg(&self) -> Option<&str> {
        self.data.get("msg").and_then(Value::as_str)
    }

    /// Overlay keys of `other` on top of this result, including its status.
    pub fn merge(&mut self, other: StepResult) {
        self.status = other.status;
        self.data.extend(other.data);
    }

    /// Test results carried under `test-results`.
    pub fn test_results(&self) -> Result<Vec<TestResultEntry>, serde_json::Error> {
        self.list("test-results")
    }

    /// Static-analysis findings carried under `issues`.
    pub fn issues(&self) -> Result<Vec<IssueEntry>, serde_json::Error> {
        self.list("issues")
    }

    /// Tests returned by `collect_tests`.
    pub fn tests(&self) -> Result<Vec<String>, serde_json::Error> {
        self.list("tests")
    }

    /// Commands advertised by `get_commands`.
    pub fn commands(&self) -> Vec<ToolCommand> {
        self.list::<String>("commands")
            .unwrap_or_default()
            .iter()
            .filter_map(|c| ToolCommand::parse(c))
            .collect()
    }

    fn list<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, serde_json::Error> {
        match self.data.get(key) {
            Some(v) => serde_json::from_value(v.clone()),
            None => Ok(Vec::new()),
        }
    }
}

/// One test outcome reported by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultEntry {
    pub test: String,
    #[serde(default)]
    pub cmd: Option<String>,
    /// Numeric result code: 0 not run, 1 passed, 2 failed, 3 error, 4 disabled, 5 unsupported.
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
}

/// One static-analysis finding reported by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEntry {
    #[serde(rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub line: i32,
    #[serde(default)]
    pub column: i32,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Job handed to an agent by `get-job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: i64,
    pub name: String,
    /// Seconds left until the job deadline.
    pub timeout: i64,
    /// Executor kind: `local`, `docker`, `lxd`, `k8s`, ...
    #[serde(default = "default_executor")]
    pub executor: String,
    /// System (image) name the job targets.
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub system_id: Option<i64>,
    pub branch_id: i64,
    /// 0 for CI flows, 1 for DEV flows.
    pub flow_kind: i32,
    pub flow_id: i64,
    pub run_id: i64,
    pub steps: Vec<StepDescriptor>,
    /// Secret values to mask in output.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<Value>,
}

fn default_executor() -> String {
    "local".to_string()
}

/// Step within a [`JobDescriptor`]. Tool fields are flattened next to the
/// fixed keys, which is also the layout of the step file given to kktool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: i64,
    pub index: i32,
    pub tool: String,
    #[serde(default)]
    pub tool_location: String,
    #[serde(default)]
    pub tool_entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<i64>,
    pub status: StepState,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StepDescriptor {
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn field_bool(&self, key: &str) -> bool {
        self.fields
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn field_u64(&self, key: &str) -> Option<u64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Run attempts, at least 1.
    pub fn attempts(&self) -> u64 {
        self.field_u64("attempts").unwrap_or(1).max(1)
    }

    pub fn sleep_time_after_attempt(&self) -> Duration {
        Duration::from_secs(self.field_u64("sleep_time_after_attempt").unwrap_or(0))
    }

    pub fn background(&self) -> bool {
        self.field_bool("background")
    }

    pub fn when(&self) -> StepPredicate {
        self.field_str("when")
            .map(StepPredicate::parse)
            .unwrap_or_default()
    }

    /// Tests preassigned to this step (after dispatching), if any.
    pub fn tests(&self) -> Vec<String> {
        self.fields
            .get("tests")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_tests(&mut self, tests: &[String]) {
        self.fields.insert("tests".into(), Value::from(tests.to_vec()));
    }
}

/// Condition deciding whether a step runs, evaluated by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepPredicate {
    /// Run only if no earlier step erred.
    #[default]
    WasNoError,
    /// Run only if some earlier step erred.
    WasAnyError,
    Always,
    Never,
    /// Run only if the immediately preceding step succeeded.
    PrevOk,
}

impl StepPredicate {
    /// Unknown names fall back to the default.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "was_any_error" => Self::WasAnyError,
            "always" | "True" | "true" => Self::Always,
            "never" | "False" | "false" => Self::Never,
            "prev_ok" => Self::PrevOk,
            _ => Self::WasNoError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WasNoError => "was_no_error",
            Self::WasAnyError => "was_any_error",
            Self::Always => "always",
            Self::Never => "never",
            Self::PrevOk => "prev_ok",
        }
    }

    /// Decide from the error history of earlier steps.
    ///
    /// `prev_ok` is `None` for the first step.
    pub fn should_run(self, any_error: bool, prev_ok: Option<bool>) -> bool {
        match self {
            Self::WasNoError => !any_error,
            Self::WasAnyError => any_error,
            Self::Always => true,
            Self::Never => false,
            Self::PrevOk => prev_ok.unwrap_or(true),
        }
    }
}

/// Commands understood by kktool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolCommand {
    GetCommands,
    CollectTests,
    RunTests,
    RunAnalysis,
    RunArtifacts,
    RunData,
    Run,
}

impl ToolCommand {
    /// Streaming run commands, in execution order. `run` comes after them.
    pub const STREAMING: [ToolCommand; 4] = [
        ToolCommand::RunTests,
        ToolCommand::RunAnalysis,
        ToolCommand::RunArtifacts,
        ToolCommand::RunData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetCommands => "get_commands",
            Self::CollectTests => "collect_tests",
            Self::RunTests => "run_tests",
            Self::RunAnalysis => "run_analysis",
            Self::RunArtifacts => "run_artifacts",
            Self::RunData => "run_data",
            Self::Run => "run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "get_commands" => Self::GetCommands,
            "collect_tests" => Self::CollectTests,
            "run_tests" => Self::RunTests,
            "run_analysis" => Self::RunAnalysis,
            "run_artifacts" => Self::RunArtifacts,
            "run_data" => Self::RunData,
            "run" => Self::Run,
            _ => return None,
        })
    }

    /// Frames of streaming commands are partial results forwarded to the server.
    pub fn is_streaming(self) -> bool {
        Self::STREAMING.contains(&self)
    }
}

impl std::fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_is_flat() {
        let req = AgentRequest::new(
            "10.0.0.5",
            AgentMessage::StepResult {
                job_id: 4,
                step_idx: 1,
                result: StepResult::error("job-timeout"),
            },
        );
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({
                "address": "10.0.0.5",
                "msg": "step-result",
                "job_id": 4,
                "step_idx": 1,
                "result": {"status": "error", "reason": "job-timeout"}
            })
        );
    }

    #[test]
    fn test_parse_get_job_and_keep_alive() {
        let req: AgentRequest =
            serde_json::from_value(json!({"address": "a", "msg": "get-job"})).unwrap();
        assert_eq!(req.message, AgentMessage::GetJob);

        let req: AgentRequest =
            serde_json::from_value(json!({"address": "a", "msg": "keep-alive"})).unwrap();
        assert_eq!(req.message, AgentMessage::KeepAlive { job_id: None });
        assert_eq!(req.message.kind(), "keep-alive");
    }

    #[test]
    fn test_unknown_message_is_rejected() {
        let res: Result<AgentRequest, _> =
            serde_json::from_value(json!({"address": "a", "msg": "bogus"}));
        assert!(res.is_err());
    }

    #[test]
    fn test_empty_job_object_means_no_job() {
        let rsp: AgentResponse = serde_json::from_value(json!({"job": {}})).unwrap();
        assert!(rsp.job.is_none());
        assert_eq!(serde_json::to_value(AgentResponse::default()).unwrap(), json!({}));
        assert_eq!(
            serde_json::to_value(AgentResponse::cancel()).unwrap(),
            json!({"cancel": true})
        );
    }

    #[test]
    fn test_step_descriptor_flattens_fields() {
        let step: StepDescriptor = serde_json::from_value(json!({
            "id": 10, "index": 0, "tool": "shell", "status": "not-started",
            "cmd": "make", "attempts": "3", "when": "prev_ok"
        }))
        .unwrap();
        assert_eq!(step.field_str("cmd"), Some("make"));
        assert_eq!(step.attempts(), 3);
        assert_eq!(step.when(), StepPredicate::PrevOk);
        assert!(!step.background());
    }

    #[test]
    fn test_step_result_accessors() {
        let result: StepResult = serde_json::from_value(json!({
            "status": "in-progress",
            "test-results": [{"test": "t1", "cmd": "pytest t1", "status": 1}],
            "issues": [{"type": "warning", "line": 3, "column": 1, "path": "a.py",
                        "symbol": "W0611", "message": "unused", "message-id": "x"}]
        }))
        .unwrap();
        let tests = result.test_results().unwrap();
        assert_eq!(tests[0].test, "t1");
        assert_eq!(tests[0].status, 1);
        let issues = result.issues().unwrap();
        assert_eq!(issues[0].issue_type, "warning");
        assert_eq!(issues[0].extra["message-id"], "x");
    }

    #[test]
    fn test_commands_skip_unknown() {
        let r = StepResult::done().with("commands", json!(["run", "collect_tests", "weird"]));
        assert_eq!(r.commands(), vec![ToolCommand::Run, ToolCommand::CollectTests]);
        assert!(ToolCommand::RunTests.is_streaming());
        assert!(!ToolCommand::Run.is_streaming());
    }

    #[test]
    fn test_predicates() {
        assert!(StepPredicate::WasNoError.should_run(false, None));
        assert!(!StepPredicate::WasNoError.should_run(true, Some(false)));
        assert!(StepPredicate::WasAnyError.should_run(true, Some(true)));
        assert!(StepPredicate::Always.should_run(true, Some(false)));
        assert!(!StepPredicate::Never.should_run(false, Some(true)));
        assert!(!StepPredicate::PrevOk.should_run(true, Some(false)));
        assert!(StepPredicate::PrevOk.should_run(true, Some(true)));
        assert_eq!(StepPredicate::parse("nonsense"), StepPredicate::WasNoError);
    }

    #[test]
    fn test_merge_overlays_status_and_keys() {
        let mut r = StepResult::in_progress().with("a", 1);
        r.merge(StepResult::done().with("b", 2));
        assert_eq!(r.status, StepState::Done);
        assert_eq!(r.data["a"], 1);
        assert_eq!(r.data["b"], 2);
    }
}
