//! Output extraction - typed values the configuration phase depends on

use provision::{OutputKind, OutputSet, OutputValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("required output '{0}' is missing")]
    MissingOutput(String),

    #[error("output '{name}' is a {found}, expected a {expected}")]
    KindMismatch {
        name: String,
        expected: OutputKind,
        found: OutputKind,
    },

    #[error("failed to read outputs file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid outputs document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("outputs document must be a JSON object")]
    NotAnObject,
}

/// Outputs the configuration phase requires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    /// List output holding the deployment target addresses
    #[serde(default = "default_targets")]
    pub targets: String,
    /// Further required outputs and their kinds
    #[serde(default)]
    pub required: BTreeMap<String, OutputKind>,
}

fn default_targets() -> String {
    "ec2_public_ips".to_string()
}

impl Default for OutputSchema {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            required: BTreeMap::new(),
        }
    }
}

/// Values pulled out of an [`OutputSet`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedValues {
    /// Target addresses, in output order
    pub targets: Vec<String>,
    /// Every required output, including the target list
    pub values: BTreeMap<String, OutputValue>,
}

impl ExtractedValues {
    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.values.get(name)
    }
}

/// Pull the outputs named by `schema`, checking their kinds
pub fn extract(outputs: &OutputSet, schema: &OutputSchema) -> Result<ExtractedValues, ExtractError> {
    let targets = require(outputs, &schema.targets, OutputKind::List)?;
    let mut values = BTreeMap::from([(schema.targets.clone(), targets.clone())]);

    for (name, kind) in &schema.required {
        let value = require(outputs, name, *kind)?;
        values.insert(name.clone(), value.clone());
    }

    let targets = targets.as_list().unwrap_or_default().to_vec();
    log::debug!(
        "Extracted {} outputs, {} targets",
        values.len(),
        targets.len()
    );
    Ok(ExtractedValues { targets, values })
}

fn require<'a>(
    outputs: &'a OutputSet,
    name: &str,
    expected: OutputKind,
) -> Result<&'a OutputValue, ExtractError> {
    let value = outputs
        .get(name)
        .ok_or_else(|| ExtractError::MissingOutput(name.to_string()))?;
    if value.kind() != expected {
        return Err(ExtractError::KindMismatch {
            name: name.to_string(),
            expected,
            found: value.kind(),
        });
    }
    Ok(value)
}

/// Parse an outputs document
///
/// Accepts the flat form `{"name": value}` as well as the wrapped form
/// `{"name": {"value": value, "type": ..., "sensitive": ...}}`.
pub fn parse_outputs(text: &str) -> Result<OutputSet, ExtractError> {
    let document: Value = serde_json::from_str(text)?;
    let Value::Object(entries) = document else {
        return Err(ExtractError::NotAnObject);
    };

    Ok(entries
        .iter()
        .map(|(name, entry)| {
            let value = match entry {
                Value::Object(wrapper) if wrapper.contains_key("value") => &wrapper["value"],
                other => other,
            };
            (name.clone(), OutputValue::from_json(value))
        })
        .collect())
}

pub fn read_outputs(path: &Path) -> Result<OutputSet, ExtractError> {
    let text = fs::read_to_string(path).map_err(|source| ExtractError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_outputs(&text)
}

/// Write outputs in the flat form
pub fn write_outputs(path: &Path, outputs: &OutputSet) -> Result<(), ExtractError> {
    let io_error = |source| ExtractError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let json = serde_json::to_string_pretty(outputs)?;
    fs::write(path, json + "\n").map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn outputs() -> OutputSet {
        OutputSet::from([
            (
                "ec2_public_ips".to_string(),
                OutputValue::List(vec!["1.2.3.4".into(), "5.6.7.8".into()]),
            ),
            (
                "rds_endpoint".to_string(),
                OutputValue::Scalar("db.example:5432".into()),
            ),
        ])
    }

    fn schema() -> OutputSchema {
        OutputSchema {
            required: BTreeMap::from([("rds_endpoint".to_string(), OutputKind::Scalar)]),
            ..OutputSchema::default()
        }
    }

    #[test]
    fn test_extract_targets_and_required() {
        let values = extract(&outputs(), &schema()).unwrap();
        assert_eq!(values.targets, vec!["1.2.3.4", "5.6.7.8"]);
        assert_eq!(
            values.get("rds_endpoint").and_then(OutputValue::as_scalar),
            Some("db.example:5432")
        );
        assert_eq!(values.values.len(), 2);
    }

    #[test]
    fn test_missing_output() {
        let mut outputs = outputs();
        outputs.remove("rds_endpoint");
        match extract(&outputs, &schema()) {
            Err(ExtractError::MissingOutput(name)) => assert_eq!(name, "rds_endpoint"),
            other => panic!("expected MissingOutput, got {other:?}"),
        }

        let err = extract(&OutputSet::new(), &OutputSchema::default()).unwrap_err();
        assert!(matches!(err, ExtractError::MissingOutput(name) if name == "ec2_public_ips"));
    }

    #[test]
    fn test_kind_mismatch_is_not_converted() {
        let outputs = OutputSet::from([(
            "ec2_public_ips".to_string(),
            OutputValue::Scalar("1.2.3.4".into()),
        )]);
        let err = extract(&outputs, &OutputSchema::default()).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::KindMismatch {
                expected: OutputKind::List,
                found: OutputKind::Scalar,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_target_list() {
        let outputs = OutputSet::from([("ec2_public_ips".to_string(), OutputValue::List(vec![]))]);
        let values = extract(&outputs, &OutputSchema::default()).unwrap();
        assert!(values.targets.is_empty());
    }

    #[test]
    fn test_parse_flat_and_wrapped() {
        let flat = parse_outputs(r#"{"ec2_public_ips": ["1.2.3.4"], "rds_endpoint": "db"}"#).unwrap();
        let wrapped = parse_outputs(
            r#"{
                "ec2_public_ips": {"value": ["1.2.3.4"], "type": ["list", "string"], "sensitive": false},
                "rds_endpoint": {"value": "db", "type": "string", "sensitive": true}
            }"#,
        )
        .unwrap();
        assert_eq!(flat, wrapped);
        assert_eq!(flat["ec2_public_ips"], OutputValue::List(vec!["1.2.3.4".into()]));

        assert!(matches!(parse_outputs("[1, 2]"), Err(ExtractError::NotAnObject)));
    }

    #[test]
    fn test_write_then_read_outputs_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifacts/outputs.json");
        write_outputs(&path, &outputs()).unwrap();
        assert_eq!(read_outputs(&path).unwrap(), outputs());
    }
}
