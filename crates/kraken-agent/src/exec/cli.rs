// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Short-lived container CLI calls (`docker`, `lxc`, `kubectl`).

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Limit for management calls such as `docker network inspect`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Run `program args…` and return its trimmed stdout.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    run_with_input(program, args, None, timeout).await
}

/// Like [`run`], feeding `input` on stdin.
pub async fn run_with_input(
    program: &str,
    args: &[&str],
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<String> {
    let line = format!("{} {}", program, args.join(" "));
    debug!(command = %line, "Running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Exec(format!("cannot run '{}': {}", line, e)))?;
    if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(data).await?;
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout(format!("'{}' took longer than {}s", line, timeout.as_secs())))??;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Exec(format!(
            "'{}' exited with {}: {}",
            line,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether `program args…` runs and succeeds within a few seconds.
pub async fn probe(program: &str, args: &[&str]) -> bool {
    run(program, args, Duration::from_secs(5)).await.is_ok()
}

/// Quote `arg` for `sh -c`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_returns_trimmed_stdout() {
        let out = run("sh", &["-c", "echo ' hi '"], DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(out, "hi");
        let out = run_with_input("cat", &[], Some(b"data"), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(out, "data");
    }

    #[tokio::test]
    async fn test_failure_and_timeout() {
        let err = run("sh", &["-c", "echo nope >&2; exit 2"], DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"), "{err}");
        let err = run("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!probe("/nonexistent/docker", &["version"]).await);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/opt/kk/step_0.json"), "/opt/kk/step_0.json");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
