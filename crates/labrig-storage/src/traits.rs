//! The [`LockRegistry`] trait defining the storage contract for machine locks.
//!
//! All backends (InMemoryStore, SqliteStore) implement this trait, ensuring
//! they are fully swappable behind the lock service. The trait is
//! synchronous: every operation is a short critical section on one record.

use labrig_core::{
    LockError, MachineAttrs, MachineFilter, MachineName, MachineRecord, MachineUpdate, Owner,
};

use crate::error::StorageError;
use crate::types::Registration;

/// The authoritative store of machine ownership and metadata.
///
/// Each mutating operation is atomic with respect to the record it targets,
/// and all mutations of one record are serialized.
pub trait LockRegistry: Send + Sync {
    /// Returns the record for `name`.
    fn get(&self, name: &MachineName) -> Result<MachineRecord, StorageError>;

    /// Returns all records matching `filter`, sorted by name.
    fn query(&self, filter: &MachineFilter) -> Result<Vec<MachineRecord>, StorageError>;

    /// Creates or updates a record from registration attributes.
    ///
    /// Never touches `locked`/`locked_by`. Fails with
    /// [`labrig_core::CoreError::InvariantViolation`] when the attributes
    /// reference a missing or virtual `vm_host`.
    fn register(
        &self,
        name: &MachineName,
        attrs: &MachineAttrs,
    ) -> Result<Registration, StorageError>;

    /// Updates description/reachability of an existing record.
    fn update(
        &self,
        name: &MachineName,
        update: &MachineUpdate,
    ) -> Result<MachineRecord, StorageError>;

    /// Locks `name` for `owner`.
    ///
    /// Idempotent when `owner` already holds the lock; fails with
    /// [`LockError::AlreadyLocked`] when someone else does.
    fn acquire(
        &self,
        name: &MachineName,
        owner: &Owner,
        description: Option<&str>,
    ) -> Result<MachineRecord, StorageError>;

    /// Unlocks `name`. Without `force`, only the holder may release.
    fn release(
        &self,
        name: &MachineName,
        owner: &Owner,
        force: bool,
    ) -> Result<MachineRecord, StorageError>;

    /// Locks `count` free, reachable machines matching `filter`, all or nothing.
    ///
    /// Candidates are tried in name order; a candidate taken by a concurrent
    /// caller in the meantime is skipped. On shortfall every lock taken by
    /// this call is released again.
    fn acquire_many(
        &self,
        count: usize,
        owner: &Owner,
        description: Option<&str>,
        filter: &MachineFilter,
    ) -> Result<Vec<MachineRecord>, StorageError> {
        let candidate_filter = MachineFilter {
            owner: None,
            locked: Some(false),
            up: Some(true),
            is_vm: filter.is_vm,
        };
        let candidates = self.query(&candidate_filter)?;
        if candidates.len() < count {
            return Err(LockError::InsufficientMachines {
                requested: count,
                available: candidates.len(),
            }
            .into());
        }

        let mut acquired = Vec::with_capacity(count);
        for candidate in candidates {
            if acquired.len() == count {
                break;
            }
            match self.acquire(&candidate.name, owner, description) {
                Ok(record) => acquired.push(record),
                Err(StorageError::Lock(LockError::AlreadyLocked { .. })) => continue,
                Err(other) => {
                    rollback(self, &acquired, owner);
                    return Err(other);
                }
            }
        }

        if acquired.len() < count {
            let available = acquired.len();
            rollback(self, &acquired, owner);
            return Err(LockError::InsufficientMachines {
                requested: count,
                available,
            }
            .into());
        }

        Ok(acquired)
    }
}

fn rollback<R: LockRegistry + ?Sized>(registry: &R, acquired: &[MachineRecord], owner: &Owner) {
    for record in acquired {
        if let Err(err) = registry.release(&record.name, owner, false) {
            tracing::warn!("Rollback of {} failed: {}", record.name, err);
        }
    }
}
