//! Progress reporting hooks
//!
//! These traits allow the engine to be driven from a terminal, a CI log or a
//! test without depending on any particular output implementation.

use crate::error::ProviderError;
use crate::planner::Action;
use crate::types::Address;

/// Progress callback for reconciliation
///
/// Implement this trait to receive progress updates while stages run.
/// Callbacks are always invoked from the calling thread.
pub trait ProgressCallback: Send {
    /// Called when a stage with pending operations starts
    fn on_stage_start(&mut self, stage: usize, count: usize);

    /// Called before a resource operation is dispatched
    fn on_resource_start(&mut self, address: &Address, action: Action);

    /// Called when a resource operation finishes
    fn on_resource_complete(&mut self, address: &Address, action: Action, error: Option<&ProviderError>);

    /// Called when a stage completes
    fn on_stage_complete(&mut self);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_stage_start(&mut self, _stage: usize, _count: usize) {}
    fn on_resource_start(&mut self, _address: &Address, _action: Action) {}
    fn on_resource_complete(&mut self, _address: &Address, _action: Action, _error: Option<&ProviderError>) {}
    fn on_stage_complete(&mut self) {}
}
