// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child process helper shared by git and the cloud provider CLIs.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Captured output is cut to this many characters in error messages.
pub const OUTPUT_EXCERPT: usize = 140;

/// A command could not be run or exited with a failure.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("cannot run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{command}' returned non-zero exit status {code}\n{stdout}\n{stderr}")]
    Failed {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// Captured stderr of a failed command, empty otherwise.
    pub fn stderr(&self) -> &str {
        match self {
            Self::Failed { stderr, .. } => stderr,
            Self::Spawn { .. } => "",
        }
    }
}

/// Run `program args…` to completion and return its stdout.
///
/// Non-zero exit statuses become [`CommandError::Failed`] carrying the first
/// [`OUTPUT_EXCERPT`] characters of each output stream.
pub async fn run(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    stdin: Option<&[u8]>,
) -> Result<String, CommandError> {
    let command = display(program, args);
    debug!(command = %command, "Running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let spawn_err = |source| CommandError::Spawn {
        command: command.clone(),
        source,
    };
    let mut child = cmd.spawn().map_err(spawn_err)?;
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(data).await.map_err(spawn_err)?;
        drop(pipe);
    }
    let output = child.wait_with_output().await.map_err(spawn_err)?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(CommandError::Failed {
        command,
        code: output.status.code().unwrap_or(-1),
        stdout: excerpt(&stdout),
        stderr: excerpt(&stderr),
    })
}

/// Shell-like rendering of a command line for logs and errors.
pub fn display(program: &str, args: &[String]) -> String {
    let mut out = program.to_string();
    for arg in args {
        out.push(' ');
        if arg.contains(char::is_whitespace) || arg.is_empty() {
            out.push('\'');
            out.push_str(arg);
            out.push('\'');
        } else {
            out.push_str(arg);
        }
    }
    out
}

fn excerpt(text: &str) -> String {
    text.trim().chars().take(OUTPUT_EXCERPT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_display_quotes_whitespace() {
        assert_eq!(
            display("git", &args(&["commit", "-m", "two words"])),
            "git commit -m 'two words'"
        );
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let long = "x".repeat(500);
        assert_eq!(excerpt(&long).len(), OUTPUT_EXCERPT);
        assert_eq!(excerpt("  short \n"), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout_and_failures() {
        let out = run("sh", &args(&["-c", "echo hello"]), None, None).await.unwrap();
        assert_eq!(out.trim(), "hello");

        let out = run("cat", &[], None, Some(b"piped")).await.unwrap();
        assert_eq!(out, "piped");

        let err = run("sh", &args(&["-c", "echo oops >&2; exit 3"]), None, None)
            .await
            .unwrap_err();
        match &err {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(*code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("non-zero exit status 3"));
    }
}
