// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandboxed rendering of schema code.

use kraken_core::persistence::{BranchRecord, FlowRecord, ProjectRecord, RunRecord, StageRecord};
use minijinja::Environment;
use serde_json::{Map, Value, json};

use super::SchemaError;

/// Name under which the schema code is registered in the environment.
const TEMPLATE_NAME: &str = "stage";

/// Name of the optional entry macro.
const ENTRY_MACRO: &str = "stage";

/// Step predicates exposed to schema code by name.
const PREDICATES: [&str; 5] = ["prev_ok", "always", "never", "was_any_error", "was_no_error"];

/// Immutable views handed to schema code as `ctx`.
///
/// The same tree (with `args` merged in at the top level) also backs `#{...}`
/// substitution of step fields and labels.
#[derive(Debug, Clone)]
pub struct SchemaContext {
    values: Map<String, Value>,
}

impl SchemaContext {
    pub fn new(branch_name: &str) -> Self {
        let mut values = Map::new();
        values.insert("branch_name".into(), Value::from(branch_name));
        values.insert("is_ci".into(), Value::Bool(false));
        values.insert("is_dev".into(), Value::Bool(false));
        values.insert("args".into(), Value::Object(Map::new()));
        for name in PREDICATES {
            values.insert(name.into(), Value::from(name));
        }
        Self { values }
    }

    pub fn with_project(mut self, project: &ProjectRecord) -> Self {
        self.values.insert(
            "project".into(),
            json!({"id": project.id, "name": project.name}),
        );
        self
    }

    pub fn with_branch(mut self, branch: &BranchRecord) -> Self {
        self.values.insert(
            "branch".into(),
            json!({
                "id": branch.id,
                "name": branch.name,
                "branch_name": branch.branch_name,
            }),
        );
        self.values
            .insert("branch_name".into(), Value::from(branch.branch_name.clone()));
        self
    }

    pub fn with_stage(mut self, stage: &StageRecord) -> Self {
        self.values
            .insert("stage".into(), json!({"id": stage.id, "name": stage.name}));
        self
    }

    pub fn with_flow(mut self, flow: &FlowRecord) -> Self {
        let is_ci = flow.kind == kraken_core::model::FlowKind::Ci;
        self.values.insert(
            "flow".into(),
            json!({
                "id": flow.id,
                "kind": flow.kind.as_flow_type(),
                "label": flow.label,
                "created": flow.created.to_rfc3339(),
                "trigger": flow.trigger_data,
            }),
        );
        self.values.insert("is_ci".into(), Value::Bool(is_ci));
        self.values.insert("is_dev".into(), Value::Bool(!is_ci));
        self
    }

    pub fn with_run(mut self, run: &RunRecord) -> Self {
        self.values.insert(
            "run".into(),
            json!({"id": run.id, "label": run.label, "reason": run.reason}),
        );
        self
    }

    /// Replace the run arguments. Non-object values are ignored.
    pub fn with_args(mut self, args: &Value) -> Self {
        if args.is_object() {
            self.values.insert("args".into(), args.clone());
        }
        self
    }

    /// The context as handed to schema code.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Variables for `#{...}` substitution: the context with the arguments
    /// (and any `extra` entries, e.g. secrets) lifted to the top level.
    pub fn substitution_vars(&self, extra: &Map<String, Value>) -> Value {
        let mut vars = self.values.clone();
        if let Some(Value::Object(args)) = self.values.get("args") {
            for (k, v) in args {
                vars.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in extra {
            vars.insert(k.clone(), v.clone());
        }
        Value::Object(vars)
    }
}

/// Render schema code and parse the result as a stage tree.
///
/// When the code defines a `stage` macro the macro is called with the
/// context; otherwise the whole template is rendered with `ctx` in scope. The
/// environment has no loader, so templates cannot include files.
pub fn evaluate(code: &str, ctx: &SchemaContext) -> Result<Value, SchemaError> {
    let mut env = Environment::new();
    env.add_template(TEMPLATE_NAME, code)?;
    let tmpl = env.get_template(TEMPLATE_NAME)?;

    let ctx_value = minijinja::Value::from_serialize(ctx.to_value());
    let root = minijinja::context! { ctx => ctx_value.clone() };

    let state = tmpl.eval_to_state(root.clone())?;
    let text = if state.lookup(ENTRY_MACRO).is_some() {
        state.call_macro(ENTRY_MACRO, &[ctx_value])?
    } else {
        tmpl.render(root)?
    };

    let text = text.trim();
    if text.is_empty() {
        return Err(SchemaError::Parse("schema code rendered nothing".into()));
    }
    let tree: Value =
        serde_json::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))?;
    if !tree.is_object() {
        return Err(SchemaError::Parse("stage schema must be a JSON object".into()));
    }
    Ok(normalize(tree))
}

/// Fill in the optional top-level keys.
pub fn normalize(mut tree: Value) -> Value {
    if let Some(obj) = tree.as_object_mut() {
        obj.entry("parent").or_insert_with(|| Value::from("root"));
        obj.entry("triggers").or_insert_with(|| json!({"parent": true}));
        obj.entry("parameters").or_insert_with(|| json!([]));
        obj.entry("configs").or_insert_with(|| json!([]));
        obj.entry("jobs").or_insert_with(|| json!([]));
    }
    tree
}
