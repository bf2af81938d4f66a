//! Lock registry storage for labrig.
//!
//! Provides the [`LockRegistry`] trait, the authoritative store of machine
//! ownership, plus [`InMemoryStore`] and [`SqliteStore`] as first-class
//! backends.
//!
//! # Serialization
//!
//! Every mutation of a given machine runs under a single serialization
//! point: a DashMap shard guard for the in-memory backend and one writer
//! connection inside an immediate transaction for SQLite. The record
//! transitions themselves live in [`labrig_core::MachineRecord`], so both
//! backends enforce identical rules.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`types`]: registration outcome types
//! - [`traits`]: LockRegistry trait definition
//! - [`memory`]: InMemoryStore implementation
//! - [`schema`]: SQL schema and migration setup
//! - [`sqlite`]: SqliteStore implementation

pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod types;

// Re-export key types for ergonomic use.
pub use error::StorageError;
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::LockRegistry;
pub use types::{RegisterOutcome, Registration};
