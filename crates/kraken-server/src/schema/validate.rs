// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow contract and per-tool step validation.

use std::sync::LazyLock;

use kraken_core::persistence::{Persistence, ToolRecord};
use serde_json::{Value, json};

use super::SchemaError;
use crate::error::Result;

/// Step keys interpreted by the agent rather than by the tool.
const STEP_CONTROL_KEYS: [&str; 2] = ["tool", "when"];

/// JSON Schema every rendered stage tree must satisfy.
static WORKFLOW_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "required": ["jobs"],
        "properties": {
            "parent": {"type": "string"},
            "triggers": {"type": "object"},
            "parameters": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string"},
                        "description": {"type": "string"}
                    }
                }
            },
            "configs": {"type": "array"},
            "flow_label": {"type": "string"},
            "run_label": {"type": "string"},
            "notification": {"type": "object"},
            "jobs": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "steps", "environments"],
                    "properties": {
                        "name": {"type": "string", "minLength": 1},
                        "timeout": {"type": "integer", "minimum": 0},
                        "steps": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["tool"],
                                "properties": {
                                    "tool": {"type": "string", "minLength": 1},
                                    "when": {"type": "string"}
                                }
                            }
                        },
                        "environments": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "required": ["system", "agents_group"],
                                "properties": {
                                    "system": {
                                        "oneOf": [
                                            {"type": "string"},
                                            {"type": "array", "items": {"type": "string"}, "minItems": 1}
                                        ]
                                    },
                                    "agents_group": {"type": "string"},
                                    "executor": {"enum": ["local", "docker", "lxd", "k8s"]},
                                    "config": {"type": "string"}
                                }
                            }
                        }
                    }
                }
            }
        }
    })
});

/// Split `name@version` into its parts.
pub fn parse_tool_ref(tool_ref: &str) -> (&str, Option<&str>) {
    match tool_ref.split_once('@') {
        Some((name, version)) if !version.is_empty() => (name, Some(version)),
        Some((name, _)) => (name, None),
        None => (tool_ref, None),
    }
}

fn collect_errors(schema: &Value, instance: &Value) -> std::result::Result<(), String> {
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Check a rendered tree against the workflow contract.
pub fn validate_workflow(tree: &Value) -> std::result::Result<(), SchemaError> {
    collect_errors(&WORKFLOW_SCHEMA, tree).map_err(SchemaError::Invalid)
}

/// Check one step against its tool's fields schema.
///
/// `job` is 1-based, `step` 0-based.
pub fn validate_step_fields(
    tool: &ToolRecord,
    step_fields: &Value,
    job: usize,
    step: usize,
) -> std::result::Result<(), SchemaError> {
    if !tool.fields_schema.is_object() {
        return Ok(());
    }
    let mut fields = step_fields.clone();
    if let Some(obj) = fields.as_object_mut() {
        for key in STEP_CONTROL_KEYS {
            obj.remove(key);
        }
    }
    collect_errors(&tool.fields_schema, &fields)
        .map_err(|reason| SchemaError::InvalidStepFields { job, step, reason })
}

/// Full check of a stage tree: the workflow contract, then every step's tool
/// reference and fields.
pub async fn check_schema(persistence: &dyn Persistence, tree: &Value) -> Result<()> {
    validate_workflow(tree)?;
    let jobs = tree.get("jobs").and_then(Value::as_array).into_iter().flatten();
    for (job_idx, job) in jobs.enumerate() {
        let steps = job.get("steps").and_then(Value::as_array).into_iter().flatten();
        for (step_idx, step) in steps.enumerate() {
            let tool_ref = step.get("tool").and_then(Value::as_str).unwrap_or_default();
            let (name, version) = parse_tool_ref(tool_ref);
            let Some(tool) = persistence.find_tool(name, version).await? else {
                return Err(SchemaError::MissingTool {
                    job: job_idx + 1,
                    step: step_idx,
                    tool: tool_ref.to_string(),
                }
                .into());
            };
            validate_step_fields(&tool, step, job_idx + 1, step_idx)?;
        }
    }
    Ok(())
}
