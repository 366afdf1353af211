//! Error types for resource graph reconciliation.
//!
//! Errors are split by the phase they belong to: graph validation happens
//! before anything is touched, state errors happen around the lock, and
//! provision errors carry the resource whose operation failed.

use thiserror::Error;

/// Invalid resource declarations, detected before any mutation.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Address is not of the form `TYPE.NAME`
    #[error("invalid resource address '{0}' (expected TYPE.NAME)")]
    InvalidAddress(String),

    /// The same address is declared twice
    #[error("resource {0} is declared more than once")]
    DuplicateResource(String),

    /// A dependency or reference points at an undeclared resource
    #[error("{resource} depends on undeclared resource {dependency}")]
    UnknownDependency {
        /// Resource declaring the dependency
        resource: String,
        /// Address that could not be found
        dependency: String,
    },

    /// A `${var.NAME}` reference names a variable that was not supplied
    #[error("{resource} references undeclared variable '{name}'")]
    UnknownVariable {
        /// Resource holding the reference
        resource: String,
        /// Variable name
        name: String,
    },

    /// A `${...}` expression that is neither a variable nor an attribute reference
    #[error("{resource} has malformed reference '${{{reference}}}'")]
    InvalidReference {
        /// Resource holding the reference
        resource: String,
        /// Raw reference text
        reference: String,
    },

    /// Two resources bind the same scalar output
    #[error("output '{name}' is bound by both {first} and {second}")]
    ConflictingOutput {
        /// Output name
        name: String,
        /// First binding resource
        first: String,
        /// Second binding resource
        second: String,
    },

    /// An output has list and scalar bindings at the same time
    #[error("output '{name}' mixes list and scalar bindings")]
    MixedOutputKinds {
        /// Output name
        name: String,
    },

    /// The dependency relation is not acyclic
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle {
        /// Addresses along the cycle, first and last are the same
        cycle: Vec<String>,
    },
}

/// Errors from the state store and its lock.
#[derive(Debug, Error)]
pub enum StateError {
    /// State key is empty or escapes the store
    #[error("invalid state key '{0}'")]
    InvalidId(String),

    /// Another run holds the lock
    #[error("state '{id}' is locked by {holder}")]
    Locked {
        /// State identifier
        id: String,
        /// Description of the current lock holder
        holder: String,
    },

    /// Unlock was attempted with a lock id that does not own the lock
    #[error("lock on state '{id}' is held by lock id {actual}, not {expected}")]
    LockMismatch {
        /// State identifier
        id: String,
        /// Lock id presented by the caller
        expected: String,
        /// Lock id found in the lock record
        actual: String,
    },

    /// Stored checksum does not match the stored content
    #[error("state '{id}' failed checksum verification (recorded {expected}, computed {actual})")]
    Corrupt {
        /// State identifier
        id: String,
        /// Checksum recorded in the state object
        expected: String,
        /// Checksum computed from the state content
        actual: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote state store error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<ureq::Error> for StateError {
    fn from(err: ureq::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Failure of a single provider operation.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider command exited unsuccessfully
    #[error("provider command failed{}: {stderr}", exit_suffix(.status))]
    Failed {
        /// Exit code, if the process exited normally
        status: Option<i32>,
        /// Standard error output from the provider
        stderr: String,
    },

    /// Provider output could not be decoded
    #[error("provider returned an invalid response: {0}")]
    InvalidResponse(String),

    /// An attribute reference had no live value at apply time
    #[error("unresolved reference ${{{0}}}")]
    Unresolved(String),

    /// IO error while talking to the provider
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

fn exit_suffix(status: &Option<i32>) -> String {
    status.map(|code| format!(" (exit {code})")).unwrap_or_default()
}

/// Errors returned by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Declarations are invalid
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// State store or lock failure
    #[error(transparent)]
    State(#[from] StateError),

    /// A resource operation failed; earlier successes are kept in state
    #[error("failed to provision {resource}: {cause}")]
    Provision {
        /// Address of the failing resource
        resource: String,
        /// Underlying provider failure
        #[source]
        cause: ProviderError,
    },

    /// The worker pool could not be created
    #[error("failed to create worker pool: {0}")]
    Pool(String),
}

impl Error {
    /// Whether the error was raised before any state mutation.
    pub fn is_pre_execution(&self) -> bool {
        matches!(self, Self::Graph(_) | Self::State(StateError::Locked { .. }))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
