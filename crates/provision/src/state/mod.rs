//! Deployment state and its lockable store
//!
//! State mutation is always scoped by a [`StateLock`]:
//! 1. The lock record is created atomically (fail fast if held)
//! 2. State is read and verified against its checksum
//! 3. Every write goes through the guard
//! 4. The lock is released when the guard drops, success or not

pub mod http;
pub mod local;

use crate::error::StateError;
use crate::types::{Address, Attributes, OutputSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current state file format version
pub const STATE_VERSION: u32 = 1;

/// Stable identifier of a state object, e.g. `webapp/prod`
///
/// Slash-separated segments of `[A-Za-z0-9._-]`; `.` and `..` are rejected so
/// file based stores cannot escape their root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(String);

impl StateId {
    pub fn new(id: impl Into<String>) -> Result<Self, StateError> {
        let id = id.into();
        let valid_segment = |segment: &str| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };

        if id.split('/').all(valid_segment) {
            Ok(Self(id))
        } else {
            Err(StateError::InvalidId(id))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live counterpart of a declared resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveResource {
    /// Declared attributes merged with provider-computed ones
    pub attributes: Attributes,
    /// Dependencies at the time of the last apply, used to order orphan deletes
    #[serde(default)]
    pub depends_on: Vec<Address>,
}

/// Persisted record of every resource that currently exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub version: u32,
    /// Incremented on every committed write
    pub serial: u64,
    /// Random id assigned when the state was first created
    pub lineage: String,
    #[serde(default)]
    pub resources: BTreeMap<Address, LiveResource>,
    /// Outputs of the last successful run
    #[serde(default)]
    pub outputs: OutputSet,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// blake3 of the content above
    #[serde(default)]
    pub checksum: String,
}

impl DeploymentState {
    /// Fresh, empty state for `id`
    pub fn new(id: &StateId) -> Self {
        let seed = format!("{id}:{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: short_hash(seed.as_bytes()),
            resources: BTreeMap::new(),
            outputs: OutputSet::new(),
            updated_at: None,
            checksum: String::new(),
        }
    }

    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&LiveResource> {
        self.resources.get(address)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Checksum over everything except the checksum itself
    pub fn compute_checksum(&self) -> Result<String, StateError> {
        let content = serde_json::to_vec(&(
            self.version,
            self.serial,
            &self.lineage,
            &self.resources,
            &self.outputs,
            &self.updated_at,
        ))?;
        Ok(blake3::hash(&content).to_hex().to_string())
    }

    /// Bump the serial and seal the content before a write
    pub fn commit(&mut self) -> Result<(), StateError> {
        self.serial += 1;
        self.updated_at = Some(Utc::now());
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    /// Check that the stored checksum matches the content
    pub fn verify(&self, id: &StateId) -> Result<(), StateError> {
        let actual = self.compute_checksum()?;
        if actual == self.checksum {
            Ok(())
        } else {
            Err(StateError::Corrupt {
                id: id.to_string(),
                expected: self.checksum.clone(),
                actual,
            })
        }
    }
}

/// Lock record stored next to the state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique id of this acquisition; required to release it
    pub id: String,
    /// Operation holding the lock (apply, destroy, ...)
    pub operation: String,
    /// `user@host` of the holder
    pub who: String,
    pub created: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(operation: impl Into<String>) -> Self {
        let who = holder_name();
        let created = Utc::now();
        let seed = format!(
            "{who}:{}:{}",
            std::process::id(),
            created.timestamp_nanos_opt().unwrap_or_default()
        );
        Self {
            id: short_hash(seed.as_bytes()),
            operation: operation.into(),
            who,
            created,
        }
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} since {}, lock id {})",
            self.who,
            self.operation,
            self.created.format("%Y-%m-%d %H:%M:%S UTC"),
            self.id
        )
    }
}

fn holder_name() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{user}@{host}")
}

fn short_hash(bytes: &[u8]) -> String {
    let hex = blake3::hash(bytes).to_hex();
    hex.as_str()[..16].to_string()
}

/// Storage for state objects and their lock records
///
/// `lock` must be atomic: when two callers race, exactly one succeeds and the
/// other gets [`StateError::Locked`].
pub trait StateBackend: Send + Sync {
    /// Read the state object, `None` if it was never written
    fn read(&self, id: &StateId) -> Result<Option<DeploymentState>, StateError>;

    /// Replace the state object
    fn write(&self, id: &StateId, state: &DeploymentState) -> Result<(), StateError>;

    /// Create the lock record, failing if one exists
    fn lock(&self, id: &StateId, info: &LockInfo) -> Result<(), StateError>;

    /// Remove the lock record if it is owned by `lock_id`
    fn unlock(&self, id: &StateId, lock_id: &str) -> Result<(), StateError>;

    /// Current lock holder, if any
    fn lock_info(&self, id: &StateId) -> Result<Option<LockInfo>, StateError>;
}

/// Read and verify state without locking
pub fn load(backend: &dyn StateBackend, id: &StateId) -> Result<Option<DeploymentState>, StateError> {
    match backend.read(id)? {
        Some(state) => {
            state.verify(id)?;
            Ok(Some(state))
        }
        None => Ok(None),
    }
}

/// Remove a stale lock left by a run that never released it
///
/// Returns the record that was removed, `None` when the state was not locked.
pub fn force_unlock(
    backend: &dyn StateBackend,
    id: &StateId,
    lock_id: &str,
) -> Result<Option<LockInfo>, StateError> {
    let Some(info) = backend.lock_info(id)? else {
        return Ok(None);
    };
    backend.unlock(id, lock_id)?;
    log::warn!("Force-unlocked state {id} (lock id {lock_id}, held by {info})");
    Ok(Some(info))
}

/// Scoped lock on a state object - releases on drop
pub struct StateLock<'a> {
    backend: &'a dyn StateBackend,
    id: StateId,
    info: LockInfo,
    released: bool,
}

impl<'a> StateLock<'a> {
    /// Acquire the lock for `operation`, failing fast when it is held
    pub fn acquire(
        backend: &'a dyn StateBackend,
        id: &StateId,
        operation: &str,
    ) -> Result<Self, StateError> {
        let info = LockInfo::new(operation);
        backend.lock(id, &info)?;
        log::debug!("Acquired state lock {} on {id}", info.id);

        Ok(Self {
            backend,
            id: id.clone(),
            info,
            released: false,
        })
    }

    #[must_use]
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    #[must_use]
    pub fn id(&self) -> &StateId {
        &self.id
    }

    /// Read verified state, or a fresh empty state if none exists
    pub fn read(&self) -> Result<DeploymentState, StateError> {
        Ok(load(self.backend, &self.id)?.unwrap_or_else(|| DeploymentState::new(&self.id)))
    }

    pub fn write(&self, state: &DeploymentState) -> Result<(), StateError> {
        self.backend.write(&self.id, state)?;
        log::debug!("Wrote state {} serial {}", self.id, state.serial);
        Ok(())
    }

    /// Release explicitly, surfacing any error
    pub fn release(mut self) -> Result<(), StateError> {
        self.released = true;
        self.backend.unlock(&self.id, &self.info.id)
    }
}

impl Drop for StateLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.backend.unlock(&self.id, &self.info.id) {
            Ok(()) => log::debug!("Released state lock on {}", self.id),
            Err(e) => log::warn!("Failed to release state lock on {}: {e}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;
    use serde_json::json;

    #[test]
    fn test_state_id_validation() {
        assert!(StateId::new("webapp").is_ok());
        assert!(StateId::new("webapp/prod-1").is_ok());
        assert!(StateId::new("").is_err());
        assert!(StateId::new("a//b").is_err());
        assert!(StateId::new("../escape").is_err());
        assert!(StateId::new("a/./b").is_err());
        assert!(StateId::new("with space").is_err());
    }

    #[test]
    fn test_commit_bumps_serial_and_seals() {
        let id = StateId::new("t").unwrap();
        let mut state = DeploymentState::new(&id);
        assert_eq!(state.serial, 0);

        state.commit().unwrap();
        assert_eq!(state.serial, 1);
        assert!(state.updated_at.is_some());
        state.verify(&id).unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let id = StateId::new("t").unwrap();
        let mut state = DeploymentState::new(&id);
        state.commit().unwrap();

        let mut attributes = Attributes::new();
        attributes.insert("id".into(), json!("i-forged"));
        state.resources.insert(
            Address::new("aws_instance", "web"),
            LiveResource {
                attributes,
                depends_on: Vec::new(),
            },
        );
        assert!(matches!(state.verify(&id), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn test_checksum_survives_json_round_trip() {
        let id = StateId::new("t").unwrap();
        let mut state = DeploymentState::new(&id);
        let mut attributes = Attributes::new();
        attributes.insert("public_ip".into(), json!("1.2.3.4"));
        attributes.insert("port".into(), json!(22));
        state.resources.insert(
            Address::new("aws_instance", "web"),
            LiveResource {
                attributes,
                depends_on: vec![Address::new("aws_vpc", "main")],
            },
        );
        state.commit().unwrap();

        let text = serde_json::to_string_pretty(&state).unwrap();
        let back: DeploymentState = serde_json::from_str(&text).unwrap();
        back.verify(&id).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_second_lock_fails_fast() {
        let backend = MemoryBackend::default();
        let id = StateId::new("webapp").unwrap();

        let first = StateLock::acquire(&backend, &id, "apply").unwrap();
        match StateLock::acquire(&backend, &id, "apply") {
            Err(StateError::Locked { holder, .. }) => assert!(holder.contains(&first.info().id)),
            other => panic!("expected Locked, got {:?}", other.map(|l| l.info().clone())),
        }

        drop(first);
        assert!(backend.lock_info(&id).unwrap().is_none());
        assert!(StateLock::acquire(&backend, &id, "apply").is_ok());
    }

    #[test]
    fn test_force_unlock_stale_lock() {
        let backend = MemoryBackend::default();
        let id = StateId::new("webapp").unwrap();
        assert!(force_unlock(&backend, &id, "whatever").unwrap().is_none());

        let info = LockInfo::new("apply");
        backend.lock(&id, &info).unwrap();
        assert!(matches!(
            force_unlock(&backend, &id, "wrong-id"),
            Err(StateError::LockMismatch { .. })
        ));

        assert_eq!(force_unlock(&backend, &id, &info.id).unwrap(), Some(info));
        assert!(backend.lock_info(&id).unwrap().is_none());
        assert!(StateLock::acquire(&backend, &id, "apply").is_ok());
    }

    #[test]
    fn test_read_through_lock_defaults_to_empty() {
        let backend = MemoryBackend::default();
        let id = StateId::new("webapp").unwrap();
        let lock = StateLock::acquire(&backend, &id, "apply").unwrap();

        let state = lock.read().unwrap();
        assert!(state.is_empty());
        assert_eq!(state.serial, 0);
        lock.release().unwrap();
    }
}
