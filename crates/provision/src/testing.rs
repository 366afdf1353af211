//! Test doubles for the provider and state backend traits

use crate::error::{ProviderError, StateError};
use crate::provider::{Provider, ResourceRequest};
use crate::state::{DeploymentState, LockInfo, StateBackend, StateId};
use crate::types::{Address, Attributes};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// Provider that records every call and returns computed attributes
///
/// Every created resource gets `id = "<type>-<name>"` plus any extra
/// attributes configured with [`RecordingProvider::computing`].
#[derive(Default)]
pub struct RecordingProvider {
    calls: Mutex<Vec<String>>,
    computed: BTreeMap<Address, Attributes>,
    failing: BTreeSet<Address>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn computing(mut self, address: &str, key: &str, value: Value) -> Self {
        let address: Address = address.parse().unwrap();
        self.computed
            .entry(address)
            .or_default()
            .insert(key.to_string(), value);
        self
    }

    pub fn failing(mut self, address: &str) -> Self {
        self.failing.insert(address.parse().unwrap());
        self
    }

    /// Calls as `"<operation> <address>"`, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, operation: &str, address: &Address) -> Result<(), ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{operation} {address}"));
        if self.failing.contains(address) {
            return Err(ProviderError::Failed {
                status: Some(1),
                stderr: format!("{operation} of {address} rejected"),
            });
        }
        Ok(())
    }

    fn attributes_for(&self, address: &Address) -> Attributes {
        let mut attributes = self.computed.get(address).cloned().unwrap_or_default();
        attributes.insert(
            "id".to_string(),
            json!(format!("{}-{}", address.resource_type, address.name)),
        );
        attributes
    }
}

impl Provider for RecordingProvider {
    fn create(&self, request: &ResourceRequest) -> Result<Attributes, ProviderError> {
        self.record("create", &request.address)?;
        Ok(self.attributes_for(&request.address))
    }

    fn update(&self, request: &ResourceRequest, live: &Attributes) -> Result<Attributes, ProviderError> {
        self.record("update", &request.address)?;
        let mut attributes = live.clone();
        attributes.extend(self.attributes_for(&request.address));
        Ok(attributes)
    }

    fn delete(&self, address: &Address, _live: &Attributes) -> Result<(), ProviderError> {
        self.record("delete", address)
    }
}

/// In-memory state backend
#[derive(Default)]
pub struct MemoryBackend {
    states: Mutex<BTreeMap<StateId, DeploymentState>>,
    locks: Mutex<BTreeMap<StateId, LockInfo>>,
    writes: Mutex<usize>,
}

impl MemoryBackend {
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }

    pub fn stored(&self, id: &StateId) -> Option<DeploymentState> {
        self.states.lock().unwrap().get(id).cloned()
    }
}

impl StateBackend for MemoryBackend {
    fn read(&self, id: &StateId) -> Result<Option<DeploymentState>, StateError> {
        Ok(self.states.lock().unwrap().get(id).cloned())
    }

    fn write(&self, id: &StateId, state: &DeploymentState) -> Result<(), StateError> {
        self.states.lock().unwrap().insert(id.clone(), state.clone());
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }

    fn lock(&self, id: &StateId, info: &LockInfo) -> Result<(), StateError> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(holder) = locks.get(id) {
            return Err(StateError::Locked {
                id: id.to_string(),
                holder: holder.to_string(),
            });
        }
        locks.insert(id.clone(), info.clone());
        Ok(())
    }

    fn unlock(&self, id: &StateId, lock_id: &str) -> Result<(), StateError> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(id) {
            Some(current) if current.id != lock_id => Err(StateError::LockMismatch {
                id: id.to_string(),
                expected: lock_id.to_string(),
                actual: current.id.clone(),
            }),
            _ => {
                locks.remove(id);
                Ok(())
            }
        }
    }

    fn lock_info(&self, id: &StateId) -> Result<Option<LockInfo>, StateError> {
        Ok(self.locks.lock().unwrap().get(id).cloned())
    }
}
