//! SQLite implementation of [`LockRegistry`].
//!
//! [`SqliteStore`] persists machine records in a SQLite database with WAL
//! mode and automatic schema migrations. The store owns one connection
//! behind a mutex and runs every mutation inside an immediate transaction:
//! read the row, apply the [`MachineRecord`] transition, write it back.
//! That makes the connection the single writer for all records, and the
//! immediate transaction keeps other processes sharing the file out of the
//! read-modify-write window.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use labrig_core::machine::validate_attrs;
use labrig_core::{
    CoreError, LockError, MachineAttrs, MachineFilter, MachineName, MachineRecord, MachineUpdate,
    Owner,
};

use crate::error::StorageError;
use crate::traits::LockRegistry;
use crate::types::{RegisterOutcome, Registration};

const SELECT_COLUMNS: &str = "SELECT name, locked, locked_by, description, up, is_vm, vm_host, \
     mac_address, last_updated FROM machines";

/// SQLite-backed lock registry.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// A row as stored, before identifier validation.
struct RawMachine {
    name: String,
    locked: bool,
    locked_by: Option<String>,
    description: Option<String>,
    up: bool,
    is_vm: bool,
    vm_host: Option<String>,
    mac_address: Option<String>,
    last_updated: String,
}

impl RawMachine {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawMachine {
            name: row.get(0)?,
            locked: row.get(1)?,
            locked_by: row.get(2)?,
            description: row.get(3)?,
            up: row.get(4)?,
            is_vm: row.get(5)?,
            vm_host: row.get(6)?,
            mac_address: row.get(7)?,
            last_updated: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<MachineRecord, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt { reason };

        let name = MachineName::new(self.name).map_err(|e| corrupt(e.to_string()))?;
        let locked_by = self
            .locked_by
            .map(Owner::new)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let vm_host = self
            .vm_host
            .map(MachineName::new)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let last_updated = DateTime::parse_from_rfc3339(&self.last_updated)
            .map_err(|e| corrupt(format!("{}: bad last_updated: {}", name, e)))?
            .with_timezone(&Utc);

        Ok(MachineRecord {
            name,
            locked: self.locked,
            locked_by,
            description: self.description,
            up: self.up,
            is_vm: self.is_vm,
            vm_host,
            mac_address: self.mac_address,
            last_updated,
        })
    }
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn load(conn: &Connection, name: &MachineName) -> Result<Option<MachineRecord>, StorageError> {
        let raw = conn
            .query_row(
                &format!("{} WHERE name = ?1", SELECT_COLUMNS),
                params![name.as_str()],
                RawMachine::from_row,
            )
            .optional()?;
        raw.map(RawMachine::into_record).transpose()
    }

    fn load_existing(conn: &Connection, name: &MachineName) -> Result<MachineRecord, StorageError> {
        Self::load(conn, name)?.ok_or_else(|| LockError::NotFound(name.clone()).into())
    }

    fn store(tx: &Transaction<'_>, record: &MachineRecord) -> Result<(), StorageError> {
        tx.execute(
            "INSERT INTO machines (name, locked, locked_by, description, up, is_vm, vm_host, \
             mac_address, last_updated) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(name) DO UPDATE SET locked = excluded.locked, \
             locked_by = excluded.locked_by, description = excluded.description, \
             up = excluded.up, is_vm = excluded.is_vm, vm_host = excluded.vm_host, \
             mac_address = excluded.mac_address, last_updated = excluded.last_updated",
            params![
                record.name.as_str(),
                record.locked,
                record.locked_by.as_ref().map(|o| o.as_str()),
                record.description,
                record.up,
                record.is_vm,
                record.vm_host.as_ref().map(|h| h.as_str()),
                record.mac_address,
                record.last_updated.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Runs a read-modify-write of one record inside an immediate transaction.
    fn mutate<F>(&self, name: &MachineName, apply: F) -> Result<MachineRecord, StorageError>
    where
        F: FnOnce(&mut MachineRecord) -> Result<bool, StorageError>,
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut record = Self::load_existing(&tx, name)?;
        if apply(&mut record)? {
            Self::store(&tx, &record)?;
        }
        tx.commit()?;
        Ok(record)
    }
}

impl LockRegistry for SqliteStore {
    fn get(&self, name: &MachineName) -> Result<MachineRecord, StorageError> {
        let conn = self.connection()?;
        Self::load_existing(&conn, name)
    }

    fn query(&self, filter: &MachineFilter) -> Result<Vec<MachineRecord>, StorageError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY name", SELECT_COLUMNS))?;
        let rows = stmt.query_map([], RawMachine::from_row)?;

        let mut records = Vec::new();
        for raw in rows {
            let record = raw?.into_record()?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn register(
        &self,
        name: &MachineName,
        attrs: &MachineAttrs,
    ) -> Result<Registration, StorageError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let host = match &attrs.vm_host {
            Some(host) => Self::load(&tx, host)?,
            None => None,
        };
        validate_attrs(name, attrs, host.as_ref())?;

        if attrs.is_vm {
            let hosts_vms: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM machines WHERE vm_host = ?1)",
                params![name.as_str()],
                |row| row.get(0),
            )?;
            if hosts_vms {
                return Err(CoreError::InvariantViolation {
                    name: name.clone(),
                    reason: "machine hosts VMs and cannot become a VM".to_string(),
                }
                .into());
            }
        }

        let now = Utc::now();
        let registration = match Self::load(&tx, name)? {
            Some(mut record) => {
                if record.apply_attrs(attrs, now) {
                    Self::store(&tx, &record)?;
                    Registration {
                        record,
                        outcome: RegisterOutcome::Updated,
                    }
                } else {
                    Registration {
                        record,
                        outcome: RegisterOutcome::Unchanged,
                    }
                }
            }
            None => {
                let record = MachineRecord::new(name.clone(), attrs.clone(), now);
                Self::store(&tx, &record)?;
                Registration {
                    record,
                    outcome: RegisterOutcome::Created,
                }
            }
        };

        tx.commit()?;
        Ok(registration)
    }

    fn update(
        &self,
        name: &MachineName,
        update: &MachineUpdate,
    ) -> Result<MachineRecord, StorageError> {
        self.mutate(name, |record| Ok(record.apply_update(update, Utc::now())))
    }

    fn acquire(
        &self,
        name: &MachineName,
        owner: &Owner,
        description: Option<&str>,
    ) -> Result<MachineRecord, StorageError> {
        self.mutate(name, |record| {
            record.try_acquire(owner, description, Utc::now())?;
            Ok(true)
        })
    }

    fn release(
        &self,
        name: &MachineName,
        owner: &Owner,
        force: bool,
    ) -> Result<MachineRecord, StorageError> {
        self.mutate(name, |record| {
            record.try_release(owner, force, Utc::now())?;
            Ok(true)
        })
    }
}
