//! Core types for resource graph reconciliation

use crate::error::GraphError;
use crate::planner::Action;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Attribute map of a resource (declared or live)
pub type Attributes = BTreeMap<String, Value>;

/// Declared variables available to `${var.NAME}` references
pub type VarMap = BTreeMap<String, Value>;

/// Named outputs produced by an apply run
pub type OutputSet = BTreeMap<String, OutputValue>;

/// Stable identity of a resource: `TYPE.NAME`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub resource_type: String,
    pub name: String,
}

impl Address {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for Address {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((resource_type, name)) if is_identifier(resource_type) && is_identifier(name) => {
                Ok(Self::new(resource_type, name))
            }
            _ => Err(GraphError::InvalidAddress(s.to_string())),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

/// Check that a string is usable as a type, name or attribute segment
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Declarative description of one cloud resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource type, e.g. `aws_instance`
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Identifying name, unique within the type
    pub name: String,
    /// Declared attributes; strings may contain `${...}` references
    #[serde(default)]
    pub attributes: Attributes,
    /// Explicit dependencies, as `TYPE.NAME` addresses
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Outputs this resource contributes to
    #[serde(default)]
    pub outputs: Vec<OutputBinding>,
}

impl ResourceSpec {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            attributes: Attributes::new(),
            depends_on: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, address: impl Into<String>) -> Self {
        self.depends_on.push(address.into());
        self
    }

    pub fn with_output(mut self, binding: OutputBinding) -> Self {
        self.outputs.push(binding);
        self
    }

    /// Validated address of this resource
    pub fn address(&self) -> Result<Address, GraphError> {
        if is_identifier(&self.resource_type) && is_identifier(&self.name) {
            Ok(Address::new(&self.resource_type, &self.name))
        } else {
            Err(GraphError::InvalidAddress(format!(
                "{}.{}",
                self.resource_type, self.name
            )))
        }
    }
}

/// Marks a resource attribute as the source of a named output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBinding {
    /// Output name
    pub name: String,
    /// Live attribute to read
    pub attribute: String,
    /// Append to a list output instead of setting a scalar
    #[serde(default)]
    pub list: bool,
}

impl OutputBinding {
    pub fn scalar(name: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attribute: attribute.into(),
            list: false,
        }
    }

    pub fn list(name: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attribute: attribute.into(),
            list: true,
        }
    }
}

/// Reconcile direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Create or update declared resources
    Apply,
    /// Remove declared resources, dependents first
    Destroy,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// Kind of an output value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Scalar,
    List,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::List => write!(f, "list"),
        }
    }
}

/// Value of a named output: a scalar or an ordered list of scalars
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Scalar(String),
    List(Vec<String>),
}

impl OutputValue {
    /// Convert a JSON value; arrays become lists, everything else a scalar
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self::List(items.iter().map(json_text).collect()),
            other => Self::Scalar(json_text(other)),
        }
    }

    pub fn kind(&self) -> OutputKind {
        match self {
            Self::Scalar(_) => OutputKind::Scalar,
            Self::List(_) => OutputKind::List,
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::Scalar(_) => None,
            Self::List(items) => Some(items),
        }
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{s}"),
            Self::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// Plain text rendering of a JSON value used for interpolation and outputs
pub fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(json_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

/// Options for reconciliation
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Maximum number of concurrent provider operations within a stage
    pub jobs: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self { jobs: 4 }
    }
}

/// Counts of resource operations performed by a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Count an action
    pub fn add(&mut self, action: &Action) {
        match action {
            Action::Create => self.created += 1,
            Action::Update => self.updated += 1,
            Action::Delete => self.deleted += 1,
            Action::NoOp => self.unchanged += 1,
        }
    }
}
