//! Core types for remote execution

use crate::error::{TargetStepError, ToleratedError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// One deployment target
///
/// Carries a reference to the credential (key file path), never key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Host address
    pub host: String,
    /// Login identity
    pub user: String,
    /// Path of the private key file
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Logical group, e.g. `web`
    pub group: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl InventoryRecord {
    pub fn new(host: impl Into<String>, user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_file: None,
            group: group.into(),
            port: DEFAULT_PORT,
        }
    }

    #[must_use]
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for InventoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_PORT {
            write!(f, "{}@{}", self.user, self.host)
        } else {
            write!(f, "{}@{}:{}", self.user, self.host, self.port)
        }
    }
}

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step modified the host
    Changed,
    /// The host already satisfied the step
    Unchanged,
    /// The step failed in a way it is allowed to
    Tolerated(ToleratedError),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Changed => write!(f, "changed"),
            Self::Unchanged => write!(f, "ok"),
            Self::Tolerated(e) => write!(f, "tolerated: {}", e.message),
        }
    }
}

/// Result of one step on one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Step label
    pub name: String,
    /// Whether the host was modified
    pub changed: bool,
    /// Failures the step tolerated on its way
    pub tolerated: Vec<ToleratedError>,
}

impl StepReport {
    /// Summarized outcome; a step that changed the host counts as changed
    /// even when part of it was tolerated
    #[must_use]
    pub fn outcome(&self) -> StepOutcome {
        match (self.changed, self.tolerated.first()) {
            (true, _) => StepOutcome::Changed,
            (false, Some(e)) => StepOutcome::Tolerated(e.clone()),
            (false, None) => StepOutcome::Unchanged,
        }
    }
}

/// Result of the whole step sequence on one target
#[derive(Debug)]
pub struct TargetReport {
    pub target: InventoryRecord,
    /// Steps that completed, in order
    pub steps: Vec<StepReport>,
    /// The failure that aborted the target, if any
    pub error: Option<TargetStepError>,
}

impl TargetReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    #[must_use]
    pub fn changed(&self) -> usize {
        self.steps.iter().filter(|s| s.changed).count()
    }

    #[must_use]
    pub fn tolerated(&self) -> usize {
        self.steps.iter().map(|s| s.tolerated.len()).sum()
    }
}

/// Result of a run, one entry per target in inventory order
#[derive(Debug, Default)]
pub struct RunReport {
    pub targets: Vec<TargetReport>,
}

impl RunReport {
    /// True when every target completed; vacuously true for no targets
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.targets.iter().all(TargetReport::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets.iter().filter(|t| !t.is_success())
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }
}

/// Options for a run
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum number of targets worked on concurrently
    pub jobs: usize,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self { jobs: 4 }
    }
}
