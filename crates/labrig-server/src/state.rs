//! Application state shared by all handlers.
//!
//! [`AppState`] holds the [`LockService`]. The registry behind it serializes
//! writes per machine on its own, so the state needs no outer mutex and
//! handlers for different machines proceed concurrently.

use std::sync::Arc;

use labrig_storage::{InMemoryStore, LockRegistry, SqliteStore};

use crate::error::ApiError;
use crate::service::LockService;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub service: LockService,
}

impl AppState {
    /// Creates state backed by the SQLite database at `db_path`.
    ///
    /// `":memory:"` selects the in-memory store instead.
    pub fn new(db_path: &str) -> Result<Self, ApiError> {
        if db_path == ":memory:" {
            return Ok(Self::in_memory());
        }
        let store = SqliteStore::new(db_path)?;
        Ok(Self::with_registry(Arc::new(store)))
    }

    /// Creates state with an empty in-memory registry (for testing).
    pub fn in_memory() -> Self {
        Self::with_registry(Arc::new(InMemoryStore::new()))
    }

    pub fn with_registry(registry: Arc<dyn LockRegistry>) -> Self {
        AppState {
            service: LockService::new(registry),
        }
    }
}
