//! Declared variables, read from the environment
//!
//! Values never live in the pipeline file: each variable names the
//! environment variable it comes from. List variables are written as
//! comma-separated text, e.g. `subnet-a, "subnet-b"`.

use provision::VarMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VarError {
    #[error("variable '{name}': environment variable {env} is not set")]
    Missing { name: String, env: String },

    #[error("variable '{name}': element {index} of the list is empty")]
    EmptyElement { name: String, index: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarKind {
    #[default]
    String,
    List,
}

/// `[variables.NAME]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecl {
    /// Environment variable holding the value
    pub env: String,
    #[serde(default)]
    pub kind: VarKind,
    /// Used when the environment variable is unset
    #[serde(default)]
    pub default: Option<String>,
}

/// Split a comma-separated list, trimming whitespace and one pair of
/// surrounding quotes from each element
///
/// An empty input is an empty list; an empty element (`a,,b`, `a, ""`) is
/// rejected. The `index` in the error is 1-based.
pub fn split_and_quote(raw: &str) -> Result<Vec<String>, usize> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    raw.split(',')
        .enumerate()
        .map(|(i, element)| {
            let element = unquote(element.trim()).trim();
            if element.is_empty() {
                Err(i + 1)
            } else {
                Ok(element.to_string())
            }
        })
        .collect()
}

fn unquote(s: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

/// Resolve every declaration through `lookup` (normally `std::env::var`)
pub fn resolve(
    decls: &BTreeMap<String, VariableDecl>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<VarMap, VarError> {
    let mut vars = VarMap::new();

    for (name, decl) in decls {
        let raw = lookup(&decl.env)
            .or_else(|| decl.default.clone())
            .ok_or_else(|| VarError::Missing {
                name: name.clone(),
                env: decl.env.clone(),
            })?;

        let value = match decl.kind {
            VarKind::String => Value::String(raw),
            VarKind::List => {
                let items = split_and_quote(&raw).map_err(|index| VarError::EmptyElement {
                    name: name.clone(),
                    index,
                })?;
                Value::Array(items.into_iter().map(Value::String).collect())
            }
        };
        log::debug!("Variable {name} read from {}", decl.env);
        vars.insert(name.clone(), value);
    }

    Ok(vars)
}

/// Resolve from the process environment
pub fn from_env(decls: &BTreeMap<String, VariableDecl>) -> Result<VarMap, VarError> {
    resolve(decls, |key| std::env::var(key).ok())
}
