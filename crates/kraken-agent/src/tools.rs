// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tool resolution.
//!
//! A step names a tool. On the agent host a `kraken_<tool>` program found in
//! the tools directories is run directly; otherwise `kktool` runs the tool
//! module given by `-m`. Inside containers kktool is always used.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use kraken_protocol::{StepDescriptor, ToolCommand};

use crate::config::AgentConfig;

/// Name of the step runner.
pub const KKTOOL: &str = "kktool";

/// Program and leading arguments used to run one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    /// Tool module passed with `-m`, absent for standalone tool programs.
    pub module: Option<String>,
}

impl ToolInvocation {
    pub fn kktool(program: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            module: Some(module.into()),
        }
    }

    /// `[-m module] -r return_addr -s step_file command`
    pub fn args(&self, return_addr: &SocketAddr, step_file: &Path, command: ToolCommand) -> Vec<String> {
        let mut args = Vec::with_capacity(7);
        if let Some(module) = &self.module {
            args.push("-m".to_string());
            args.push(module.clone());
        }
        args.push("-r".to_string());
        args.push(return_addr.to_string());
        args.push("-s".to_string());
        args.push(step_file.display().to_string());
        args.push(command.as_str().to_string());
        args
    }
}

/// Module name kktool loads for `step`.
pub fn tool_module(step: &StepDescriptor) -> String {
    if step.tool_entry.is_empty() {
        format!("kraken_{}", step.tool)
    } else {
        step.tool_entry.clone()
    }
}

/// Resolve how to run the tool of `step`.
pub fn resolve(config: &AgentConfig, step: &StepDescriptor, on_host: bool) -> ToolInvocation {
    if !on_host {
        return ToolInvocation::kktool(KKTOOL, tool_module(step));
    }
    if let Some(path) = config.find_tool_file(&format!("kraken_{}", step.tool)) {
        return ToolInvocation {
            program: path.display().to_string(),
            module: None,
        };
    }
    let kktool = find_kktool(config)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| KKTOOL.to_string());
    ToolInvocation::kktool(kktool, tool_module(step))
}

/// kktool on the agent host: tools directories first, then `PATH`.
pub fn find_kktool(config: &AgentConfig) -> Option<PathBuf> {
    config
        .find_tool_file(KKTOOL)
        .or_else(|| find_in_path(KKTOOL))
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(tool: &str, entry: &str) -> StepDescriptor {
        serde_json::from_value(json!({
            "id": 1, "index": 0, "tool": tool, "tool_entry": entry, "status": "not-started"
        }))
        .unwrap()
    }

    #[test]
    fn test_args_layout() {
        let inv = ToolInvocation::kktool("kktool", "kraken_shell");
        let addr: SocketAddr = "10.0.0.1:4321".parse().unwrap();
        assert_eq!(
            inv.args(&addr, Path::new("/d/step_0.json"), ToolCommand::RunTests),
            vec!["-m", "kraken_shell", "-r", "10.0.0.1:4321", "-s", "/d/step_0.json", "run_tests"]
        );
    }

    #[test]
    fn test_module_prefers_tool_entry() {
        assert_eq!(tool_module(&step("shell", "")), "kraken_shell");
        assert_eq!(tool_module(&step("pytest", "my_pytest")), "my_pytest");
    }

    #[test]
    fn test_host_program_in_tools_dir_runs_directly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kraken_shell"), "#!/bin/sh\n").unwrap();
        let mut cfg = AgentConfig::new("http://k");
        cfg.tools_dirs = vec![dir.path().to_path_buf()];

        let inv = resolve(&cfg, &step("shell", ""), true);
        assert_eq!(inv.module, None);
        assert!(inv.program.ends_with("kraken_shell"));

        let inv = resolve(&cfg, &step("shell", ""), false);
        assert_eq!(inv, ToolInvocation::kktool("kktool", "kraken_shell"));
    }

    #[test]
    fn test_kktool_from_tools_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kktool"), "#!/bin/sh\n").unwrap();
        let mut cfg = AgentConfig::new("http://k");
        cfg.tools_dirs = vec![dir.path().to_path_buf()];

        let inv = resolve(&cfg, &step("pylint", ""), true);
        assert_eq!(inv.program, dir.path().join("kktool").display().to_string());
        assert_eq!(inv.module.as_deref(), Some("kraken_pylint"));
    }
}
