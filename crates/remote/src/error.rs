//! Error types for remote execution.
//!
//! Errors are categorized so the caller can tell a host that could not be
//! reached from a step that ran and failed, and give matching advice.

use thiserror::Error;

/// Categories of remote errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Host unreachable, authentication refused, or ssh itself failed
    Connection,
    /// Remote permission denied (may need `sudo = true`)
    Permission,
    /// A command or file used by the step does not exist
    NotFound,
    /// A step ran and failed its postcondition
    Verification,
    /// Credential could not be prepared
    Credential,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Connection => "Could not connect to host",
            Self::Permission => "Permission denied on host",
            Self::NotFound => "Command or file not found on host",
            Self::Verification => "Postcondition not met",
            Self::Credential => "Credential unavailable",
            Self::Other => "Step failed",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Connection => "Check the host is up, port 22 is reachable and the key is authorized",
            Self::Permission => "Set sudo = true on the step or fix ownership on the host",
            Self::NotFound => "Install the missing tool in an earlier step",
            Self::Verification => "Inspect the application log on the host",
            Self::Credential => "Check the private key environment variable or key_file",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors that can occur while talking to a host.
#[derive(Debug, Error)]
pub enum Error {
    /// ssh could not establish the session (exit 255)
    #[error("cannot connect to {host}: {message}")]
    Connection {
        /// Target host
        host: String,
        /// ssh diagnostics
        message: String,
    },

    /// Remote command exited unsuccessfully
    #[error("command failed{}: {stderr}", exit_suffix(.status))]
    CommandFailed {
        /// Exit code, if the process exited normally
        status: Option<i32>,
        /// Standard error output from the remote command
        stderr: String,
    },

    /// A postcondition check failed
    #[error("verification failed: {0}")]
    Verification(String),

    /// Key material could not be written or found
    #[error("credential error: {0}")]
    Credential(String),

    /// The worker pool could not be created
    #[error("failed to create worker pool: {0}")]
    Pool(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_suffix(status: &Option<i32>) -> String {
    status.map(|code| format!(" (exit {code})")).unwrap_or_default()
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Verification(_) => ErrorCategory::Verification,
            Self::Credential(_) => ErrorCategory::Credential,
            Self::CommandFailed { status, stderr } => {
                let lower = stderr.to_lowercase();
                if *status == Some(127) || lower.contains("command not found") {
                    ErrorCategory::NotFound
                } else if lower.contains("permission denied")
                    || lower.contains("a password is required")
                    || lower.contains("are you root")
                {
                    ErrorCategory::Permission
                } else {
                    ErrorCategory::Other
                }
            }
            Self::Pool(_) | Self::Io(_) => ErrorCategory::Other,
        }
    }
}

/// A failure that aborts the remaining steps of one target.
///
/// Sibling targets are not affected.
#[derive(Debug, Error)]
#[error("{host}: step {index} ({step}) failed: {source}")]
pub struct TargetStepError {
    /// Target host
    pub host: String,
    /// 1-based position of the step
    pub index: usize,
    /// Step label
    pub step: String,
    /// Underlying failure
    pub source: Error,
}

/// A failure the step is allowed to have; logged and reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step}: {message}")]
pub struct ToleratedError {
    /// Step label
    pub step: String,
    /// What went wrong
    pub message: String,
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = Error::Connection {
            host: "10.0.0.1".into(),
            message: "Connection timed out".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert_eq!(err.category().description(), "Could not connect to host");

        let err = Error::CommandFailed {
            status: Some(127),
            stderr: "sh: 1: gunicorn: not found".into(),
        };
        assert_eq!(err.category(), ErrorCategory::NotFound);

        let err = Error::CommandFailed {
            status: Some(100),
            stderr: "E: Could not open lock file - open (13: Permission denied)".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Permission);
        assert!(err.category().advice().contains("sudo = true"));
    }

    #[test]
    fn test_target_step_error_message() {
        let err = TargetStepError {
            host: "1.2.3.4".into(),
            index: 2,
            step: "packages (apt)".into(),
            source: Error::CommandFailed {
                status: Some(100),
                stderr: "unable to locate package".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "1.2.3.4: step 2 (packages (apt)) failed: command failed (exit 100): unable to locate package"
        );
    }
}
