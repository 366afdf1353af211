//! Transport trait - how scripts reach a host

pub mod ssh;

use crate::error::Result;
use crate::types::InventoryRecord;

/// Output of a remote script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a shell script on a target
///
/// Returns `Err` only when the script could not be run at all (connection
/// failure); a script that ran and exited non-zero is an `Ok` output.
pub trait Transport: Send + Sync {
    fn run(
        &self,
        target: &InventoryRecord,
        script: &str,
        stdin: Option<&[u8]>,
        sudo: bool,
    ) -> Result<CommandOutput>;
}
