//! LockService: the single coordinator between HTTP handlers and the
//! lock registry.
//!
//! The service validates request fields (machine names, owners, counts) and
//! dispatches to [`LockRegistry`]. State transitions and their rules live in
//! the registry; nothing here decides who may hold a machine.

use std::sync::Arc;

use labrig_core::{
    LockError, MachineFilter, MachineName, MachineRecord, MachineUpdate, Owner,
};
use labrig_storage::{LockRegistry, Registration, StorageError};

use crate::error::ApiError;
use crate::schema::locks::{
    ListLocksQuery, LockManyRequest, LockManyResponse, MachineLockResult, MachineLockStatus,
    SetLockRequest,
};
use crate::schema::machines::AddMachineRequest;

/// Validating front of a [`LockRegistry`].
#[derive(Clone)]
pub struct LockService {
    registry: Arc<dyn LockRegistry>,
}

impl LockService {
    pub fn new(registry: Arc<dyn LockRegistry>) -> Self {
        LockService { registry }
    }

    /// The underlying registry, for in-process callers.
    pub fn registry(&self) -> Arc<dyn LockRegistry> {
        Arc::clone(&self.registry)
    }

    /// Returns one machine's record.
    pub fn get(&self, name: &str) -> Result<MachineRecord, ApiError> {
        let name = MachineName::new(name)?;
        Ok(self.registry.get(&name)?)
    }

    /// Lists machines matching the query, sorted by name.
    pub fn list(&self, query: ListLocksQuery) -> Result<Vec<MachineRecord>, ApiError> {
        let owner = query.owner.map(Owner::new).transpose()?;
        let filter = MachineFilter {
            owner,
            locked: query.locked,
            up: query.up,
            is_vm: query.is_vm,
        };
        Ok(self.registry.query(&filter)?)
    }

    /// Locks an explicit list of machines, or any `count` free machines.
    pub fn lock_many(&self, req: LockManyRequest) -> Result<LockManyResponse, ApiError> {
        let owner = Owner::new(req.owner)?;
        let description = req.description.as_deref();

        match (req.machines, req.count) {
            (Some(_), Some(_)) => Err(ApiError::BadRequest(
                "give either 'machines' or 'count', not both".to_string(),
            )),
            (None, None) => Err(ApiError::BadRequest(
                "one of 'machines' or 'count' is required".to_string(),
            )),
            (None, Some(0)) => Err(ApiError::BadRequest("count must be positive".to_string())),
            (None, Some(count)) => {
                let filter = MachineFilter {
                    is_vm: req.is_vm,
                    ..Default::default()
                };
                let machines = self
                    .registry
                    .acquire_many(count, &owner, description, &filter)?;
                tracing::info!("{} locked {} machine(s)", owner, machines.len());
                Ok(LockManyResponse {
                    all_locked: true,
                    results: machines
                        .iter()
                        .map(|record| MachineLockResult {
                            name: record.name.to_string(),
                            status: MachineLockStatus::Locked,
                            current_owner: None,
                        })
                        .collect(),
                    machines,
                })
            }
            (Some(names), None) => {
                if names.is_empty() {
                    return Err(ApiError::BadRequest("'machines' is empty".to_string()));
                }
                let names = names
                    .into_iter()
                    .map(MachineName::new)
                    .collect::<Result<Vec<_>, _>>()?;
                self.lock_listed(&names, &owner, description)
            }
        }
    }

    fn lock_listed(
        &self,
        names: &[MachineName],
        owner: &Owner,
        description: Option<&str>,
    ) -> Result<LockManyResponse, ApiError> {
        let mut results = Vec::with_capacity(names.len());
        let mut machines = Vec::new();
        // Locks this call took, as opposed to ones `owner` already held.
        let mut taken: Vec<&MachineName> = Vec::new();

        for name in names {
            let held_before = matches!(
                self.registry.get(name),
                Ok(record) if record.locked_by.as_ref() == Some(owner)
            );
            let (status, current_owner) = match self.registry.acquire(name, owner, description) {
                Ok(record) => {
                    if !held_before {
                        taken.push(name);
                    }
                    machines.push(record);
                    (MachineLockStatus::Locked, None)
                }
                Err(StorageError::Lock(LockError::AlreadyLocked { current_owner, .. })) => {
                    (MachineLockStatus::AlreadyLocked, Some(current_owner.to_string()))
                }
                Err(StorageError::Lock(LockError::NotFound(_))) => {
                    (MachineLockStatus::NotFound, None)
                }
                Err(other) => {
                    self.undo_listed(&taken, owner);
                    return Err(other.into());
                }
            };
            results.push(MachineLockResult {
                name: name.to_string(),
                status,
                current_owner,
            });
        }

        let all_locked = results
            .iter()
            .all(|r| r.status == MachineLockStatus::Locked);
        tracing::info!(
            "{} locked {}/{} requested machine(s)",
            owner,
            machines.len(),
            names.len()
        );
        Ok(LockManyResponse {
            all_locked,
            results,
            machines,
        })
    }

    fn undo_listed(&self, taken: &[&MachineName], owner: &Owner) {
        for name in taken {
            if let Err(err) = self.registry.release(name, owner, false) {
                tracing::warn!("could not release {} after a failed lock request: {}", name, err);
            }
        }
    }

    /// Acquires or releases one machine.
    pub fn set_lock(&self, name: &str, req: SetLockRequest) -> Result<MachineRecord, ApiError> {
        let name = MachineName::new(name)?;
        let owner = Owner::new(req.owner)?;

        let record = if req.locked {
            let record = self
                .registry
                .acquire(&name, &owner, req.description.as_deref())?;
            tracing::info!("{} locked by {}", name, owner);
            record
        } else {
            let record = self.registry.release(&name, &owner, req.force)?;
            if req.force {
                tracing::warn!("{} force-unlocked by {}", name, owner);
            } else {
                tracing::info!("{} unlocked by {}", name, owner);
            }
            record
        };
        Ok(record)
    }

    /// Updates description and reachability.
    pub fn update(&self, name: &str, update: MachineUpdate) -> Result<MachineRecord, ApiError> {
        let name = MachineName::new(name)?;
        Ok(self.registry.update(&name, &update)?)
    }

    /// Registers or re-registers a machine.
    pub fn register(&self, req: AddMachineRequest) -> Result<Registration, ApiError> {
        let name = MachineName::new(req.name)?;
        let registration = self.registry.register(&name, &req.attrs)?;
        tracing::debug!("registered {} ({:?})", name, registration.outcome);
        Ok(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labrig_core::MachineAttrs;
    use labrig_storage::InMemoryStore;

    fn service_with(hosts: &[&str]) -> LockService {
        let store = InMemoryStore::new();
        for host in hosts {
            store
                .register(&MachineName::new(*host).unwrap(), &MachineAttrs::physical())
                .unwrap();
        }
        LockService::new(Arc::new(store))
    }

    fn lock_req(owner: &str) -> LockManyRequest {
        LockManyRequest {
            machines: None,
            count: None,
            owner: owner.to_string(),
            description: None,
            is_vm: None,
        }
    }

    #[test]
    fn empty_owner_is_rejected_before_touching_the_registry() {
        let service = service_with(&["ubuntu@mira001"]);
        let err = service
            .set_lock(
                "ubuntu@mira001",
                SetLockRequest {
                    locked: true,
                    owner: String::new(),
                    description: None,
                    force: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(!service.get("ubuntu@mira001").unwrap().locked);
    }

    #[test]
    fn zero_count_is_rejected() {
        let service = service_with(&["ubuntu@mira001"]);
        let err = service
            .lock_many(LockManyRequest {
                count: Some(0),
                ..lock_req("alice")
            })
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn listed_lock_reports_each_machine() {
        let service = service_with(&["ubuntu@mira001", "ubuntu@mira002"]);
        service
            .set_lock(
                "ubuntu@mira002",
                SetLockRequest {
                    locked: true,
                    owner: "bob".into(),
                    description: None,
                    force: false,
                },
            )
            .unwrap();

        let resp = service
            .lock_many(LockManyRequest {
                machines: Some(vec![
                    "ubuntu@mira001".into(),
                    "ubuntu@mira002".into(),
                    "ubuntu@ghost".into(),
                ]),
                ..lock_req("alice")
            })
            .unwrap();

        assert!(!resp.all_locked);
        let statuses: Vec<_> = resp.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            [
                MachineLockStatus::Locked,
                MachineLockStatus::AlreadyLocked,
                MachineLockStatus::NotFound
            ]
        );
        assert_eq!(resp.results[1].current_owner.as_deref(), Some("bob"));
        assert_eq!(resp.machines.len(), 1);
    }

    /// Delegates to an in-memory store but breaks on one machine.
    struct BrokenOn {
        inner: InMemoryStore,
        broken: MachineName,
    }

    impl LockRegistry for BrokenOn {
        fn get(&self, name: &MachineName) -> Result<MachineRecord, StorageError> {
            self.inner.get(name)
        }

        fn query(&self, filter: &MachineFilter) -> Result<Vec<MachineRecord>, StorageError> {
            self.inner.query(filter)
        }

        fn register(
            &self,
            name: &MachineName,
            attrs: &MachineAttrs,
        ) -> Result<Registration, StorageError> {
            self.inner.register(name, attrs)
        }

        fn update(
            &self,
            name: &MachineName,
            update: &MachineUpdate,
        ) -> Result<MachineRecord, StorageError> {
            self.inner.update(name, update)
        }

        fn acquire(
            &self,
            name: &MachineName,
            owner: &Owner,
            description: Option<&str>,
        ) -> Result<MachineRecord, StorageError> {
            if *name == self.broken {
                return Err(StorageError::Corrupt {
                    reason: "bad row".to_string(),
                });
            }
            self.inner.acquire(name, owner, description)
        }

        fn release(
            &self,
            name: &MachineName,
            owner: &Owner,
            force: bool,
        ) -> Result<MachineRecord, StorageError> {
            self.inner.release(name, owner, force)
        }
    }

    #[test]
    fn storage_failure_mid_list_releases_what_the_request_took() {
        let inner = InMemoryStore::new();
        for host in ["ubuntu@mira001", "ubuntu@mira002", "ubuntu@mira003"] {
            inner
                .register(&MachineName::new(host).unwrap(), &MachineAttrs::physical())
                .unwrap();
        }
        let alice = Owner::new("alice").unwrap();
        let already_held = MachineName::new("ubuntu@mira002").unwrap();
        inner.acquire(&already_held, &alice, None).unwrap();

        let service = LockService::new(Arc::new(BrokenOn {
            inner,
            broken: MachineName::new("ubuntu@mira003").unwrap(),
        }));

        let result = service.lock_many(LockManyRequest {
            machines: Some(vec![
                "ubuntu@mira001".into(),
                "ubuntu@mira002".into(),
                "ubuntu@mira003".into(),
            ]),
            ..lock_req("alice")
        });

        assert!(result.is_err());
        assert!(!service.get("ubuntu@mira001").unwrap().locked);
        // A lock held before the request is left alone.
        let held = service.get("ubuntu@mira002").unwrap();
        assert_eq!(held.locked_by, Some(alice));
    }
}
