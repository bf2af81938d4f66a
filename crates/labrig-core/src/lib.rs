//! Core data model for the labrig test-lab orchestrator.
//!
//! - [`machine`]: machine identity, lock records, registration attributes
//!   and query filters
//! - [`command`]: structured shell command builder rendered by remote
//!   session backends
//! - [`error`]: lock-domain and validation errors shared by every crate

pub mod command;
pub mod error;
pub mod machine;

// Re-export commonly used types
pub use command::{Arg, Command};
pub use error::{CoreError, LockError};
pub use machine::{
    MachineAttrs, MachineFilter, MachineName, MachineRecord, MachineUpdate, Owner,
};
