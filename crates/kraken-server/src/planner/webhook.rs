// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mapping of repository events onto flows.

use kraken_core::model::FlowKind;
use kraken_core::persistence::StageRecord;
use serde_json::{Map, Value, json};
use tracing::info;
use url::Url;

use super::{FlowRequest, create_flow, start_run};
use crate::context::ServerContext;
use crate::error::Result;

/// Canonical https form of a git URL, used to compare repositories.
///
/// `git@host:org/repo.git`, `ssh://git@host/org/repo` and
/// `https://HOST/org/repo.git/` all become `https://host/org/repo`.
pub fn normalize_repo_url(url: &str) -> String {
    let url = url.trim();
    let rewritten = match url.split_once("://") {
        Some(_) => url.to_string(),
        None => match url.split_once(':') {
            Some((host, path)) => {
                let host = host.rsplit('@').next().unwrap_or(host);
                format!("https://{}/{}", host, path.trim_start_matches('/'))
            }
            None => url.to_string(),
        },
    };
    let Ok(parsed) = Url::parse(&rewritten) else {
        return rewritten.trim_end_matches('/').trim_end_matches(".git").to_string();
    };
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let path = parsed.path().trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    format!("https://{}{}", host, path)
}

/// Repositories a stage checks out: `checkout` fields of its git steps.
fn stage_repos(stage: &StageRecord) -> Vec<String> {
    let jobs = stage.schema.get("jobs").and_then(Value::as_array).into_iter().flatten();
    jobs.flat_map(|job| job.get("steps").and_then(Value::as_array).into_iter().flatten())
        .filter(|step| {
            step.get("tool")
                .and_then(Value::as_str)
                .is_some_and(|t| t.starts_with("git"))
        })
        .filter_map(|step| step.get("checkout").and_then(Value::as_str))
        .map(normalize_repo_url)
        .collect()
}

/// Handle a normalized repository event of a project.
///
/// Push events start CI flows on the pushed branch, pull requests start DEV
/// flows on the base branch. When the branch's last flow has stages checking
/// out the event's repository that did not run yet, they are started there;
/// otherwise a new flow is created.
pub async fn trigger_flow(ctx: &ServerContext, project_id: i64, trigger: &Value) -> Result<()> {
    let event = trigger.get("trigger").and_then(Value::as_str).unwrap_or_default();
    let (kind, branch_field) = if event.ends_with("-push") {
        (FlowKind::Ci, "branch")
    } else if event.ends_with("-pull_request") {
        (FlowKind::Dev, "base_branch")
    } else {
        info!(project_id, event, "Ignoring unsupported trigger");
        return Ok(());
    };
    let Some(branch_name) = trigger.get(branch_field).and_then(Value::as_str) else {
        info!(project_id, event, "Trigger without branch ignored");
        return Ok(());
    };

    let branches = ctx.persistence.list_project_branches(project_id).await?;
    let Some(branch) = branches.into_iter().find(|b| b.branch_name == branch_name) else {
        info!(project_id, branch = branch_name, "No branch configured for trigger");
        return Ok(());
    };

    let repo = trigger
        .get("repo")
        .and_then(Value::as_str)
        .map(normalize_repo_url);
    if let (Some(repo), Some(flow)) = (&repo, ctx.persistence.last_flow(branch.id, Some(kind)).await?)
    {
        let mut started = 0;
        for stage in ctx.persistence.list_branch_stages(branch.id).await? {
            if !stage.enabled || !stage_repos(&stage).contains(repo) {
                continue;
            }
            if ctx.persistence.find_run(flow.id, stage.id).await?.is_some() {
                continue;
            }
            let reason = json!({"reason": event, "repo": repo});
            start_run(ctx, &stage, &flow, reason, json!({})).await?;
            started += 1;
        }
        if started > 0 {
            info!(flow_id = flow.id, started, "Trigger started stages in the last flow");
            return Ok(());
        }
    }

    let flow = create_flow(
        ctx,
        branch.id,
        kind,
        FlowRequest {
            args: Map::new(),
            stage_args: Map::new(),
            trigger_data: Some(trigger.clone()),
        },
    )
    .await?;
    info!(flow_id = flow.id, event, branch = branch_name, "Flow created from trigger");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_repo_url() {
        let expected = "https://github.com/org/repo";
        assert_eq!(normalize_repo_url("git@github.com:org/repo.git"), expected);
        assert_eq!(normalize_repo_url("https://GitHub.com/org/repo.git/"), expected);
        assert_eq!(normalize_repo_url("ssh://git@github.com/org/repo"), expected);
        assert_eq!(normalize_repo_url("https://github.com/org/repo"), expected);
    }

    #[test]
    fn test_stage_repos_reads_git_steps() {
        let stage = StageRecord {
            id: 1,
            branch_id: 1,
            name: "tests".into(),
            enabled: true,
            schema_code: String::new(),
            schema: json!({"jobs": [{"steps": [
                {"tool": "git", "checkout": "git@github.com:org/repo.git"},
                {"tool": "shell", "checkout": "https://github.com/other/x"}
            ]}]}),
            schema_from_repo_enabled: false,
            repo_url: None,
            repo_branch: None,
            repo_access_token: None,
            schema_file: None,
            repo_state: None,
            repo_error: None,
            repo_version: None,
            timeouts: json!({}),
            triggers: json!({}),
            created: chrono::Utc::now(),
            deleted: None,
        };
        assert_eq!(stage_repos(&stage), vec!["https://github.com/org/repo".to_string()]);
    }
}
