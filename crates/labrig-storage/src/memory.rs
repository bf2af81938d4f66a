//! In-memory implementation of [`LockRegistry`].
//!
//! [`InMemoryStore`] is a first-class backend for tests and single-process
//! lock servers. Records live in a `DashMap`; a record is mutated only while
//! its shard's write guard is held, which makes that guard the per-record
//! serialization point for acquire/release/update.
//!
//! Registrations additionally take a store-wide mutex because they read a
//! second record (the VM host) before writing the first. DashMap guards are
//! never held across a lookup of another key, so the store cannot deadlock
//! on its own shards.

use std::sync::Mutex;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use labrig_core::machine::validate_attrs;
use labrig_core::{
    CoreError, LockError, MachineAttrs, MachineFilter, MachineName, MachineRecord, MachineUpdate,
    Owner,
};

use crate::error::StorageError;
use crate::traits::LockRegistry;
use crate::types::{RegisterOutcome, Registration};

/// DashMap-backed lock registry.
pub struct InMemoryStore {
    machines: DashMap<MachineName, MachineRecord>,
    registrations: Mutex<()>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        InMemoryStore {
            machines: DashMap::new(),
            registrations: Mutex::new(()),
        }
    }

    /// Number of registered machines.
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    fn not_found(name: &MachineName) -> StorageError {
        LockError::NotFound(name.clone()).into()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry for InMemoryStore {
    fn get(&self, name: &MachineName) -> Result<MachineRecord, StorageError> {
        self.machines
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Self::not_found(name))
    }

    fn query(&self, filter: &MachineFilter) -> Result<Vec<MachineRecord>, StorageError> {
        let mut records: Vec<MachineRecord> = self
            .machines
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn register(
        &self,
        name: &MachineName,
        attrs: &MachineAttrs,
    ) -> Result<Registration, StorageError> {
        // The guard protects no data; a poisoned lock is still a valid lock.
        let _serialized = self
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let host = attrs
            .vm_host
            .as_ref()
            .and_then(|host| self.machines.get(host).map(|entry| entry.value().clone()));
        validate_attrs(name, attrs, host.as_ref())?;

        if attrs.is_vm {
            let hosts_vms = self
                .machines
                .iter()
                .any(|entry| entry.value().vm_host.as_ref() == Some(name));
            if hosts_vms {
                return Err(CoreError::InvariantViolation {
                    name: name.clone(),
                    reason: "machine hosts VMs and cannot become a VM".to_string(),
                }
                .into());
            }
        }

        let now = Utc::now();
        match self.machines.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                let changed = occupied.get_mut().apply_attrs(attrs, now);
                let outcome = if changed {
                    RegisterOutcome::Updated
                } else {
                    RegisterOutcome::Unchanged
                };
                Ok(Registration {
                    record: occupied.get().clone(),
                    outcome,
                })
            }
            Entry::Vacant(vacant) => {
                let record = MachineRecord::new(name.clone(), attrs.clone(), now);
                vacant.insert(record.clone());
                Ok(Registration {
                    record,
                    outcome: RegisterOutcome::Created,
                })
            }
        }
    }

    fn update(
        &self,
        name: &MachineName,
        update: &MachineUpdate,
    ) -> Result<MachineRecord, StorageError> {
        let mut entry = self
            .machines
            .get_mut(name)
            .ok_or_else(|| Self::not_found(name))?;
        entry.value_mut().apply_update(update, Utc::now());
        Ok(entry.value().clone())
    }

    fn acquire(
        &self,
        name: &MachineName,
        owner: &Owner,
        description: Option<&str>,
    ) -> Result<MachineRecord, StorageError> {
        let mut entry = self
            .machines
            .get_mut(name)
            .ok_or_else(|| Self::not_found(name))?;
        entry
            .value_mut()
            .try_acquire(owner, description, Utc::now())?;
        Ok(entry.value().clone())
    }

    fn release(
        &self,
        name: &MachineName,
        owner: &Owner,
        force: bool,
    ) -> Result<MachineRecord, StorageError> {
        let mut entry = self
            .machines
            .get_mut(name)
            .ok_or_else(|| Self::not_found(name))?;
        entry.value_mut().try_release(owner, force, Utc::now())?;
        Ok(entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> MachineName {
        MachineName::new(s).unwrap()
    }

    fn owner(s: &str) -> Owner {
        Owner::new(s).unwrap()
    }

    #[test]
    fn register_then_lock_roundtrip() {
        let store = InMemoryStore::new();
        let host = name("ubuntu@plana01.front.example.com");

        let reg = store.register(&host, &MachineAttrs::physical()).unwrap();
        assert_eq!(reg.outcome, RegisterOutcome::Created);
        assert!(!reg.record.locked);

        let locked = store.acquire(&host, &owner("alice"), Some("nightly")).unwrap();
        assert!(locked.locked);
        assert_eq!(locked.locked_by, Some(owner("alice")));
        assert_eq!(store.get(&host).unwrap(), locked);
    }

    #[test]
    fn missing_machine_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .acquire(&name("ubuntu@ghost"), &owner("alice"), None)
            .unwrap_err();
        assert!(matches!(err, StorageError::Lock(LockError::NotFound(_))));
    }

    #[test]
    fn reregistering_identical_attrs_keeps_the_lock() {
        let store = InMemoryStore::new();
        let host = name("ubuntu@mira001");
        store.register(&host, &MachineAttrs::physical()).unwrap();
        let locked = store.acquire(&host, &owner("alice"), None).unwrap();

        let reg = store.register(&host, &MachineAttrs::physical()).unwrap();
        assert_eq!(reg.outcome, RegisterOutcome::Unchanged);
        assert_eq!(reg.record, locked);
    }

    #[test]
    fn vm_registration_validates_its_host() {
        let store = InMemoryStore::new();
        let host = name("ubuntu@mira001");
        let vm = name("ubuntu@vpm001");

        let err = store
            .register(&vm, &MachineAttrs::vm(host.clone(), None))
            .unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));

        store.register(&host, &MachineAttrs::physical()).unwrap();
        let reg = store
            .register(&vm, &MachineAttrs::vm(host.clone(), Some("52:54:00:00:00:01".into())))
            .unwrap();
        assert_eq!(reg.record.vm_host, Some(host.clone()));

        // A host with VMs on it cannot be turned into a VM itself.
        let other = name("ubuntu@mira002");
        store.register(&other, &MachineAttrs::physical()).unwrap();
        let err = store
            .register(&host, &MachineAttrs::vm(other, None))
            .unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    #[test]
    fn update_bumps_only_on_change() {
        let store = InMemoryStore::new();
        let host = name("ubuntu@mira001");
        let created = store.register(&host, &MachineAttrs::physical()).unwrap().record;

        let same = store
            .update(&host, &MachineUpdate { description: None, up: Some(true) })
            .unwrap();
        assert_eq!(same.last_updated, created.last_updated);

        let down = store
            .update(&host, &MachineUpdate { description: None, up: Some(false) })
            .unwrap();
        assert!(!down.up);
        assert!(down.last_updated >= created.last_updated);
    }
}
