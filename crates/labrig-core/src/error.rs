//! Core error types for labrig-core.
//!
//! Uses `thiserror` for structured, matchable error variants. [`LockError`]
//! is the lock-domain taxonomy every layer (registry, HTTP service, clients)
//! speaks; [`CoreError`] covers malformed identifiers and record invariant
//! violations.

use thiserror::Error;

use crate::machine::{MachineName, Owner};

/// Failures of a single lock operation against one machine (or one batch).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The machine is held by a different owner.
    #[error("{name} is already locked by {current_owner}")]
    AlreadyLocked {
        name: MachineName,
        current_owner: Owner,
    },

    /// A release was attempted by someone who does not hold the lock.
    #[error("{owner} does not hold the lock on {name}")]
    NotOwner {
        name: MachineName,
        owner: Owner,
        current_owner: Option<Owner>,
    },

    /// No record exists for the machine.
    #[error("machine not found: {0}")]
    NotFound(MachineName),

    /// A lock-N-machines request could not be satisfied.
    #[error("requested {requested} machine(s) but only {available} are free")]
    InsufficientMachines { requested: usize, available: usize },
}

/// Validation errors for identifiers and machine records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A machine name was empty or malformed.
    #[error("invalid machine name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// An owner identity was empty or malformed.
    #[error("invalid owner '{owner}': {reason}")]
    InvalidOwner { owner: String, reason: &'static str },

    /// Applying a change would break a record invariant.
    #[error("invariant violated for {name}: {reason}")]
    InvariantViolation { name: MachineName, reason: String },
}
