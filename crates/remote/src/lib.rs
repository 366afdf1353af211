//! # Remote
//!
//! Idempotent, ordered task execution on a fleet of hosts.
//!
//! Given an inventory and an ordered list of [`TaskStep`]s, the executor runs
//! the whole sequence on every target. Targets are independent: a failure
//! aborts the remaining steps of that target only.
//!
//! ## Example
//!
//! ```ignore
//! use remote::{Credential, Executor, InventoryRecord, TaskStep};
//! use remote::transport::ssh::{SshOptions, SshTransport};
//!
//! let credential = Credential::materialize(&std::env::var("SSH_PRIVATE_KEY")?, None)?;
//! let transport = SshTransport::new(SshOptions::default()).with_identity(credential.path());
//!
//! let inventory = vec![InventoryRecord::new("1.2.3.4", "ec2-user", "web")];
//! let steps = vec![TaskStep::Shell {
//!     name: "hello".into(),
//!     command: "echo hello".into(),
//!     creates: None,
//!     sudo: false,
//! }];
//!
//! let report = Executor::new(&transport).run(&inventory, &steps)?;
//! assert!(report.is_success());
//! ```
//!
//! ## Idempotence
//!
//! No completion record is kept between runs. Each step is written so that
//! running it again on a converged host changes nothing, and reports whether
//! it changed the host.

pub mod credential;
pub mod error;
pub mod executor;
pub mod step;
pub mod transport;
pub mod types;

// Re-export main types at crate root
pub use credential::Credential;
pub use error::{Error, ErrorCategory, Result, TargetStepError, ToleratedError};
pub use executor::{ExecutionObserver, Executor, NoObserver};
pub use step::{PackageManager, TaskStep};
pub use transport::{CommandOutput, Transport};
pub use types::{
    ExecuteOptions, InventoryRecord, RunReport, StepOutcome, StepReport, TargetReport,
};
