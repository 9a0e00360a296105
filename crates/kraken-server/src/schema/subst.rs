// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `#{dotted.path}` substitution over JSON trees.
//!
//! Every string inside the tree is rendered twice: once with real values (what
//! the agent executes) and once with secrets replaced by `******` (what is
//! stored for display). Unknown paths render as `<ERROR>`.

use std::collections::HashSet;
use std::sync::LazyLock;

use kraken_protocol::messages::SECRET_MASK;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

/// Rendering of an unresolved path.
pub const UNKNOWN_VAR: &str = "<ERROR>";

static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\{([^{}]+)\}").expect("variable pattern is valid"));

/// Real and masked renderings of one tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub fields: Value,
    pub masked: Value,
}

/// Substitute every `#{...}` reference in `tree`.
///
/// `vars` is the lookup root; `secret_names` are the top-level variables whose
/// values are masked in [`Substitution::masked`].
pub fn substitute(tree: &Value, vars: &Value, secret_names: &HashSet<String>) -> Substitution {
    Substitution {
        fields: walk(tree, &|s| render(s, vars, None)),
        masked: walk(tree, &|s| render(s, vars, Some(secret_names))),
    }
}

/// Substitute a single string, unmasked.
pub fn substitute_str(text: &str, vars: &Value) -> String {
    render(text, vars, None)
}

fn walk(value: &Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| walk(v, f)).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), walk(v, f)))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

fn render(text: &str, vars: &Value, mask: Option<&HashSet<String>>) -> String {
    if !text.contains("#{") {
        return text.to_string();
    }
    VAR_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let path = caps[1].trim();
            if let Some(secrets) = mask {
                let root = path.split('.').next().unwrap_or(path);
                if secrets.contains(path) || secrets.contains(root) {
                    return SECRET_MASK.to_string();
                }
            }
            match lookup(vars, path) {
                Some(v) => value_text(v),
                None => UNKNOWN_VAR.to_string(),
            }
        })
        .into_owned()
}

/// Resolve a dotted path. A flat key containing dots wins over traversal.
pub fn lookup<'a>(vars: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = vars.get(path) {
        return Some(v).filter(|v| !v.is_null());
    }
    let mut cur = vars;
    for part in path.split('.') {
        cur = match cur {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur).filter(|v| !v.is_null())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Value {
        json!({
            "KK_FLOW_SEQ": "12",
            "KK_SECRET_SIMPLE_token": "abc",
            "branch": {"name": "main", "tags": ["x", "y"]},
            "count": 3,
        })
    }

    fn secrets() -> HashSet<String> {
        HashSet::from(["KK_SECRET_SIMPLE_token".to_string()])
    }

    #[test]
    fn test_nested_containers_are_substituted() {
        let tree = json!({
            "cmd": "build #{KK_FLOW_SEQ} on #{branch.name}",
            "env": [{"TOKEN": "#{KK_SECRET_SIMPLE_token}"}, "#{branch.tags.1}"],
            "retries": 2,
        });
        let out = substitute(&tree, &vars(), &secrets());
        assert_eq!(out.fields["cmd"], "build 12 on main");
        assert_eq!(out.fields["env"][0]["TOKEN"], "abc");
        assert_eq!(out.fields["env"][1], "y");
        assert_eq!(out.fields["retries"], 2);
        assert_eq!(out.masked["env"][0]["TOKEN"], "******");
        assert_eq!(out.masked["cmd"], "build 12 on main");
    }

    #[test]
    fn test_unknown_path_renders_error_marker() {
        assert_eq!(substitute_str("v=#{nope.x}", &vars()), "v=<ERROR>");
        assert_eq!(substitute_str("#{branch.tags.9}", &vars()), "<ERROR>");
    }

    #[test]
    fn test_non_string_values_are_rendered_as_json() {
        assert_eq!(substitute_str("#{count} #{branch.tags}", &vars()), r#"3 ["x","y"]"#);
    }

    #[test]
    fn test_substitution_is_idempotent() {
        let tree = json!({"a": "#{KK_FLOW_SEQ}-#{missing}", "b": ["#{branch.name}"]});
        let once = substitute(&tree, &vars(), &secrets());
        let twice = substitute(&once.fields, &vars(), &secrets());
        assert_eq!(once.fields, twice.fields);
    }

    #[test]
    fn test_text_without_references_is_untouched() {
        assert_eq!(substitute_str("plain { text }", &vars()), "plain { text }");
    }
}
