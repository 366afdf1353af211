//! Provider trait - the seam between the engine and a cloud API

pub mod command;

use crate::error::ProviderError;
use crate::types::{Address, Attributes};

/// A resource operation request with every reference already resolved
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    pub address: Address,
    pub attributes: Attributes,
}

/// Performs resource operations against the real world
///
/// Implementations must be safe to call from several threads at once: the
/// engine dispatches independent resources of one stage concurrently.
pub trait Provider: Send + Sync {
    /// Create a resource, returning its live attributes
    fn create(&self, request: &ResourceRequest) -> Result<Attributes, ProviderError>;

    /// Update an existing resource in place, returning its live attributes
    fn update(&self, request: &ResourceRequest, live: &Attributes) -> Result<Attributes, ProviderError>;

    /// Delete a resource
    fn delete(&self, address: &Address, live: &Attributes) -> Result<(), ProviderError>;
}
