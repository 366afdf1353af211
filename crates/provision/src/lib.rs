//! # Provision
//!
//! A resource graph engine for declarative infrastructure.
//!
//! This crate reconciles a declared set of typed cloud resources against the
//! live state recorded in a lockable, externally persisted state store.
//!
//! ## Core Concepts
//!
//! - **ResourceSpec**: One declared resource (type, name, attributes, dependencies)
//! - **ResourceGraph**: The validated dependency DAG, layered into stages
//! - **DeploymentState**: Live attributes of every resource that currently exists
//! - **StateLock**: Scoped, fail-fast mutual exclusion over a state identifier
//! - **Engine**: Plans and reconciles specs in `Apply` or `Destroy` mode
//!
//! ## Example
//!
//! ```ignore
//! use provision::{
//!     Engine, LocalBackend, Mode, OutputBinding, ResourceSpec, StateId, VarMap,
//! };
//! use provision::provider::command::CommandProvider;
//!
//! let specs = vec![
//!     ResourceSpec::new("aws_vpc", "main").with_attribute("cidr_block", "10.0.0.0/16"),
//!     ResourceSpec::new("aws_instance", "web")
//!         .with_attribute("subnet", "${aws_vpc.main.id}")
//!         .with_output(OutputBinding::list("ec2_public_ips", "public_ip")),
//! ];
//!
//! let provider = CommandProvider::new("deckhand-aws");
//! let backend = LocalBackend::new("/var/lib/deckhand");
//! let engine = Engine::new(&provider, &backend, StateId::new("web/prod")?);
//!
//! let result = engine.reconcile(&specs, Mode::Apply, &VarMap::new())?;
//! println!("{:?}", result.outputs.get("ec2_public_ips"));
//! ```
//!
//! ## Provider Traits
//!
//! The crate uses traits for dependency injection:
//!
//! - [`Provider`]: Performs create/update/delete against the cloud API
//! - [`StateBackend`]: Stores the state object and its lock record
//! - [`ProgressCallback`]: Receives progress updates
//!
//! This keeps the engine free of any particular cloud SDK, storage service
//! or terminal UI.

pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reference;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types at crate root
pub use context::{NoProgress, ProgressCallback};
pub use engine::{Engine, Reconciliation};
pub use error::{Error, GraphError, ProviderError, Result, StateError};
pub use graph::ResourceGraph;
pub use planner::{Action, AttributeChange, Plan, PlannedChange};
pub use provider::command::CommandProvider;
pub use provider::{Provider, ResourceRequest};
pub use state::http::HttpBackend;
pub use state::local::LocalBackend;
pub use state::{DeploymentState, LiveResource, LockInfo, StateBackend, StateId, StateLock};
pub use types::{
    Address, Attributes, Mode, OutputBinding, OutputKind, OutputSet, OutputValue,
    ReconcileOptions, ReconcileSummary, ResourceSpec, VarMap,
};
