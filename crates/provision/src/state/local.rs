//! File system state store
//!
//! Layout under the root directory:
//! - `<key>.json` - current state
//! - `<key>.json.backup` - previous state
//! - `<key>.lock` - lock record, created with `create_new`

use super::{DeploymentState, LockInfo, StateBackend, StateId};
use crate::error::StateError;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// State store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the state file for `id`
    #[must_use]
    pub fn state_path(&self, id: &StateId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn backup_path(&self, id: &StateId) -> PathBuf {
        self.root.join(format!("{id}.json.backup"))
    }

    fn temp_path(&self, id: &StateId) -> PathBuf {
        self.root.join(format!("{id}.json.tmp"))
    }

    fn lock_path(&self, id: &StateId) -> PathBuf {
        self.root.join(format!("{id}.lock"))
    }

    fn ensure_parent(path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl StateBackend for LocalBackend {
    fn read(&self, id: &StateId) -> Result<Option<DeploymentState>, StateError> {
        let path = self.state_path(id);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No state at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, id: &StateId, state: &DeploymentState) -> Result<(), StateError> {
        let path = self.state_path(id);
        Self::ensure_parent(&path)?;

        let temp = self.temp_path(id);
        fs::write(&temp, serde_json::to_string_pretty(state)?)?;

        if path.exists() {
            fs::copy(&path, self.backup_path(id))?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn lock(&self, id: &StateId, info: &LockInfo) -> Result<(), StateError> {
        let path = self.lock_path(id);
        Self::ensure_parent(&path)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = self
                    .lock_info(id)
                    .ok()
                    .flatten()
                    .map_or_else(|| format!("unreadable lock file {}", path.display()), |i| i.to_string());
                return Err(StateError::Locked {
                    id: id.to_string(),
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(serde_json::to_string_pretty(info)?.as_bytes())?;
        Ok(())
    }

    fn unlock(&self, id: &StateId, lock_id: &str) -> Result<(), StateError> {
        let Some(current) = self.lock_info(id)? else {
            log::debug!("State {id} is not locked");
            return Ok(());
        };

        if current.id != lock_id {
            return Err(StateError::LockMismatch {
                id: id.to_string(),
                expected: lock_id.to_string(),
                actual: current.id,
            });
        }

        fs::remove_file(self.lock_path(id))?;
        Ok(())
    }

    fn lock_info(&self, id: &StateId) -> Result<Option<LockInfo>, StateError> {
        match fs::read_to_string(self.lock_path(id)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
