// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain enumerations shared by the server, the agent and the store.
//!
//! Integer-backed enums are persisted as `INTEGER` columns; their numeric
//! values are part of the database contract and must not be renumbered.
//!
//! | Enum | Values |
//! |------|--------|
//! | [`JobState`] | prequeued(1) → queued(2) → assigned(3) → executing-finished(4) → completed(5) |
//! | [`RunState`] | in-progress(1), completed(2), processed(3), manual(4) |
//! | [`FlowState`] | in-progress(1), completed(2) |
//! | [`StepStatus`] | not-started(0), in-progress(1), done(2), error(3), skipped(4) |
//! | [`TcResult`] | not-run(0), passed(1), failed(2), error(3), disabled(4), unsupported(5) |
//! | [`ResultChange`] | no(0), fix(1), regression(2), new(3) |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Run timeout used when the stage schema does not declare one.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

/// Job timeout used when neither the schema nor the learned table has one.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Agents not seen for this long are disabled.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Lower bound for any job timeout, in seconds.
pub const MIN_JOB_TIMEOUT_SECS: i32 = 60;

/// Placeholder system name for agents that have not reported host info.
pub const FAKE_SYSTEM: &str = "fake";

/// System name meaning "any system in the group".
pub const ANY_SYSTEM: &str = "any";

/// Lifecycle state of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Created during planning, run not yet in progress.
    Prequeued = 1,
    /// Waiting for the scheduler.
    Queued = 2,
    /// Bound to an agent.
    Assigned = 3,
    /// Last step reported a terminal status; awaiting analysis.
    ExecutingFinished = 4,
    /// Terminal.
    Completed = 5,
}

impl JobState {
    /// Whether the job holds (or held) an agent in this state.
    pub fn is_assigned_or_later(self) -> bool {
        self >= JobState::Assigned
    }
}

/// Cause of a job reaching the completed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    /// Every step succeeded.
    AllOk = 0,
    /// The job exceeded its timeout.
    JobTimeout = 1,
    /// A step reported an error.
    AgentErrorReturned = 2,
    /// The agent or tool raised an exception.
    AgentException = 3,
    /// A step references a tool not known to the server.
    MissingToolInDb = 4,
    /// The tool is registered but its files are unavailable.
    MissingToolFiles = 5,
    /// A single step exceeded its deadline.
    StepTimeout = 6,
    /// The server stopped waiting (agent gone, run timed out).
    ServerTimeout = 7,
    /// An operator cancelled the job.
    UserCancel = 8,
    /// The requested agents group does not exist.
    MissingAgentsGroup = 9,
    /// The agents group has no agents and cannot spawn any.
    NoAgents = 10,
}

impl CompletionStatus {
    /// Stable upper-snake name used in notes and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllOk => "ALL_OK",
            Self::JobTimeout => "JOB_TIMEOUT",
            Self::AgentErrorReturned => "AGENT_ERROR_RETURNED",
            Self::AgentException => "AGENT_EXCEPTION",
            Self::MissingToolInDb => "MISSING_TOOL_IN_DB",
            Self::MissingToolFiles => "MISSING_TOOL_FILES",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::ServerTimeout => "SERVER_TIMEOUT",
            Self::UserCancel => "USER_CANCEL",
            Self::MissingAgentsGroup => "MISSING_AGENTS_GROUP",
            Self::NoAgents => "NO_AGENTS",
        }
    }

    /// Statuses that mark a broken build; issue history skips such jobs.
    pub fn is_broken_build(self) -> bool {
        matches!(
            self,
            Self::AgentErrorReturned | Self::JobTimeout | Self::StepTimeout
        )
    }

    /// Whether the job counts as erroneous in run summaries.
    pub fn is_error(self) -> bool {
        self != Self::AllOk
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one step within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    /// Not yet picked up by the agent.
    NotStarted = 0,
    /// Running; partial results may have been reported.
    InProgress = 1,
    /// Finished successfully.
    Done = 2,
    /// Finished with an error.
    Error = 3,
    /// Not executed because its predicate evaluated to false.
    Skipped = 4,
}

impl StepStatus {
    /// Terminal statuses end the step for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Skipped)
    }
}

/// Outcome of a single test case execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum TcResult {
    NotRun = 0,
    Passed = 1,
    Failed = 2,
    Error = 3,
    Disabled = 4,
    Unsupported = 5,
}

/// Classification of a result against its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum ResultChange {
    /// Same result as the previous one.
    No = 0,
    /// Passed now, was not passing before.
    Fix = 1,
    /// Not passing now, was passing before.
    Regression = 2,
    /// No history.
    New = 3,
}

/// State of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    InProgress = 1,
    Completed = 2,
    /// Completed and its results history was analyzed.
    Processed = 3,
    /// Created but waiting for an operator to start it.
    Manual = 4,
}

impl RunState {
    /// Completed or processed.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Processed)
    }
}

/// State of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum FlowState {
    InProgress = 1,
    Completed = 2,
}

/// Flow kind: CI flows build history, DEV flows are compared against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    Ci = 0,
    Dev = 1,
}

impl FlowKind {
    /// Value exposed to schemas as `KK_FLOW_TYPE`.
    pub fn as_flow_type(self) -> &'static str {
        match self {
            Self::Ci => "CI",
            Self::Dev => "DEV",
        }
    }
}

/// Static-analysis finding category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Error = 0,
    Warning = 1,
    Convention = 2,
    Refactor = 3,
}

impl IssueType {
    /// Map a tool-reported type name; unknown names are treated as warnings.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "error" | "fatal" => Self::Error,
            "convention" | "info" => Self::Convention,
            "refactor" => Self::Refactor,
            _ => Self::Warning,
        }
    }
}

/// Kind of a per-branch monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum SeqKind {
    Flow = 0,
    CiFlow = 1,
    DevFlow = 2,
    Run = 3,
    CiRun = 4,
    DevRun = 5,
}

impl SeqKind {
    /// Whether the counter is scoped to a stage rather than the whole branch.
    pub fn is_stage_scoped(self) -> bool {
        matches!(self, Self::Run | Self::CiRun | Self::DevRun)
    }
}

/// Kind of project secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum SecretKind {
    Simple = 0,
    SshKey = 1,
}

/// Visibility of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactSection {
    Public = 1,
    Private = 2,
}

impl ArtifactSection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

/// JSON document a `data` step reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserDataScope {
    Project,
    Branch,
    BranchCi,
    BranchDev,
    Flow,
}

impl UserDataScope {
    /// Parse a step's `scope` field. Empty means the flow.
    pub fn parse(scope: &str) -> Option<Self> {
        match scope {
            "project" => Some(Self::Project),
            "branch" => Some(Self::Branch),
            "branch-ci" => Some(Self::BranchCi),
            "branch-dev" => Some(Self::BranchDev),
            "flow" | "" => Some(Self::Flow),
            _ => None,
        }
    }
}

/// Triage state of a test case comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum CommentState {
    New = 0,
    Investigating = 1,
    BugInProduct = 2,
    BugInTest = 3,
    SystemIssue = 4,
    EnvIssue = 5,
}

/// State of a stage's schema-from-repository refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum RepoState {
    Ok = 1,
    Error = 2,
    Refreshing = 3,
}

/// State of a background task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Ready to be claimed once `run_at` passes.
    Pending = 0,
    /// Claimed by a worker.
    Running = 1,
    /// Parked behind a running task with the same coalescing key.
    Waiting = 2,
    Done = 3,
    Failed = 4,
}

/// Where a job's steps execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    Local,
    Docker,
    Lxd,
    #[serde(alias = "k8s")]
    Kubernetes,
    AwsEc2,
    AwsFargate,
    AzureVm,
}

impl ExecutorKind {
    /// Textual form stored in the `systems.executor` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Lxd => "lxd",
            Self::Kubernetes => "kubernetes",
            Self::AwsEc2 => "aws-ec2",
            Self::AwsFargate => "aws-fargate",
            Self::AzureVm => "azure-vm",
        }
    }

    /// Parse the stored form; `k8s` is accepted as an alias.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "local" => Self::Local,
            "docker" => Self::Docker,
            "lxd" => Self::Lxd,
            "kubernetes" | "k8s" => Self::Kubernetes,
            "aws-ec2" => Self::AwsEc2,
            "aws-fargate" | "aws-ecs-fargate" => Self::AwsFargate,
            "azure-vm" => Self::AzureVm,
            _ => return None,
        })
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloud deployment method of an agents group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMethod {
    /// Statically registered agents; no provisioning.
    Manual,
    AwsEc2,
    AwsEcsFargate,
    AzureVm,
    Kubernetes,
}

impl DeploymentMethod {
    /// Whether machines of this kind are destroyed after every job.
    pub fn is_single_job(self) -> bool {
        matches!(self, Self::AwsEcsFargate | Self::Kubernetes)
    }

    /// Whether agents of this group are provisioned by the fleet manager.
    pub fn is_cloud(self) -> bool {
        self != Self::Manual
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_ordering() {
        assert!(JobState::Prequeued < JobState::Queued);
        assert!(JobState::Assigned < JobState::ExecutingFinished);
        assert!(JobState::Assigned.is_assigned_or_later());
        assert!(!JobState::Queued.is_assigned_or_later());
    }

    #[test]
    fn test_completion_status_names() {
        assert_eq!(CompletionStatus::JobTimeout.to_string(), "JOB_TIMEOUT");
        assert_eq!(
            serde_json::to_string(&CompletionStatus::MissingAgentsGroup).unwrap(),
            "\"MISSING_AGENTS_GROUP\""
        );
        assert!(CompletionStatus::StepTimeout.is_broken_build());
        assert!(!CompletionStatus::UserCancel.is_broken_build());
    }

    #[test]
    fn test_user_data_scope_parse() {
        assert_eq!(UserDataScope::parse(""), Some(UserDataScope::Flow));
        assert_eq!(UserDataScope::parse("branch-ci"), Some(UserDataScope::BranchCi));
        assert_eq!(UserDataScope::parse("project"), Some(UserDataScope::Project));
        assert_eq!(UserDataScope::parse("run"), None);
        assert_eq!(ArtifactSection::Private.as_str(), "private");
    }

    #[test]
    fn test_step_status_serde() {
        let s: StepStatus = serde_json::from_str("\"in-progress\"").unwrap();
        assert_eq!(s, StepStatus::InProgress);
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_executor_kind_parse() {
        assert_eq!(ExecutorKind::parse("k8s"), Some(ExecutorKind::Kubernetes));
        assert_eq!(ExecutorKind::parse("docker"), Some(ExecutorKind::Docker));
        assert_eq!(ExecutorKind::parse("vmware"), None);
        assert_eq!(ExecutorKind::AwsEc2.as_str(), "aws-ec2");
    }

    #[test]
    fn test_issue_type_from_name() {
        assert_eq!(IssueType::from_name("ERROR"), IssueType::Error);
        assert_eq!(IssueType::from_name("refactor"), IssueType::Refactor);
        assert_eq!(IssueType::from_name("whatever"), IssueType::Warning);
    }

    #[test]
    fn test_deployment_method() {
        let m: DeploymentMethod = serde_json::from_str("\"aws-ecs-fargate\"").unwrap();
        assert!(m.is_single_job());
        assert!(!DeploymentMethod::AwsEc2.is_single_job());
        assert!(!DeploymentMethod::Manual.is_cloud());
    }
}
