//! Machine identity and lock records.
//!
//! A [`MachineRecord`] is the unit of ownership in the lab: one physical host
//! or VM, who holds it, and whether it is reachable. The state transitions
//! (`try_acquire`, `try_release`, `apply_attrs`, `apply_update`) live here so
//! every registry backend applies exactly the same rules while holding its
//! own per-record serialization point.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, LockError};

/// Unique machine identifier, e.g. `ubuntu@plana01.front.example.com`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineName(String);

impl MachineName {
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::InvalidName {
                name,
                reason: "name is empty",
            });
        }
        if name.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidName {
                name,
                reason: "name contains whitespace",
            });
        }
        if name.contains(|c: char| matches!(c, '/' | '?' | '#' | '%')) {
            return Err(CoreError::InvalidName {
                name,
                reason: "name contains a URL delimiter",
            });
        }
        if name.ends_with('@') {
            return Err(CoreError::InvalidName {
                name,
                reason: "missing host after '@'",
            });
        }
        Ok(MachineName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host part, without any `user@` prefix.
    pub fn host(&self) -> &str {
        match self.0.rsplit_once('@') {
            Some((_, host)) => host,
            None => &self.0,
        }
    }

    /// The host up to its first dot (`plana01` for `ubuntu@plana01.front.example.com`).
    pub fn shortname(&self) -> &str {
        let host = self.host();
        match host.split_once('.') {
            Some((short, _)) => short,
            None => host,
        }
    }
}

impl fmt::Display for MachineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MachineName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MachineName::new(s)
    }
}

impl TryFrom<String> for MachineName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MachineName::new(value)
    }
}

impl From<MachineName> for String {
    fn from(name: MachineName) -> Self {
        name.0
    }
}

/// Identity holding or requesting a lock (a user or a scheduled job id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Owner(String);

impl Owner {
    pub fn new(owner: impl Into<String>) -> Result<Self, CoreError> {
        let owner = owner.into();
        if owner.trim().is_empty() {
            return Err(CoreError::InvalidOwner {
                owner,
                reason: "owner is empty",
            });
        }
        Ok(Owner(owner))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Owner {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Owner::new(s)
    }
}

impl TryFrom<String> for Owner {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Owner::new(value)
    }
}

impl From<Owner> for String {
    fn from(owner: Owner) -> Self {
        owner.0
    }
}

/// Attributes supplied when registering a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAttrs {
    #[serde(default = "default_up")]
    pub up: bool,
    #[serde(default)]
    pub is_vm: bool,
    #[serde(default)]
    pub vm_host: Option<MachineName>,
    #[serde(default)]
    pub mac_address: Option<String>,
    /// Applied only when present; re-registration never clears it.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_up() -> bool {
    true
}

impl Default for MachineAttrs {
    fn default() -> Self {
        MachineAttrs {
            up: true,
            is_vm: false,
            vm_host: None,
            mac_address: None,
            description: None,
        }
    }
}

impl MachineAttrs {
    /// Attributes for a physical host.
    pub fn physical() -> Self {
        Self::default()
    }

    /// Attributes for a VM hosted on `vm_host`.
    pub fn vm(vm_host: MachineName, mac_address: Option<String>) -> Self {
        MachineAttrs {
            is_vm: true,
            vm_host: Some(vm_host),
            mac_address,
            ..Self::default()
        }
    }
}

/// Metadata/status update for an existing machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineUpdate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub up: Option<bool>,
}

/// Conjunctive query filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineFilter {
    #[serde(default)]
    pub owner: Option<Owner>,
    #[serde(default)]
    pub locked: Option<bool>,
    #[serde(default)]
    pub up: Option<bool>,
    #[serde(default)]
    pub is_vm: Option<bool>,
}

impl MachineFilter {
    pub fn matches(&self, record: &MachineRecord) -> bool {
        if let Some(owner) = &self.owner {
            if record.locked_by.as_ref() != Some(owner) {
                return false;
            }
        }
        if self.locked.is_some_and(|l| l != record.locked) {
            return false;
        }
        if self.up.is_some_and(|u| u != record.up) {
            return false;
        }
        if self.is_vm.is_some_and(|v| v != record.is_vm) {
            return false;
        }
        true
    }
}

/// Authoritative lock and status record for one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub name: MachineName,
    pub locked: bool,
    pub locked_by: Option<Owner>,
    pub description: Option<String>,
    pub up: bool,
    pub is_vm: bool,
    /// Physical host of a VM. Lookup-only; the host record is never owned.
    pub vm_host: Option<MachineName>,
    pub mac_address: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl MachineRecord {
    /// Creates an unlocked record from registration attributes.
    pub fn new(name: MachineName, attrs: MachineAttrs, now: DateTime<Utc>) -> Self {
        MachineRecord {
            name,
            locked: false,
            locked_by: None,
            description: attrs.description,
            up: attrs.up,
            is_vm: attrs.is_vm,
            vm_host: attrs.vm_host,
            mac_address: attrs.mac_address,
            last_updated: now,
        }
    }

    pub fn is_held_by(&self, owner: &Owner) -> bool {
        self.locked && self.locked_by.as_ref() == Some(owner)
    }

    /// Takes the lock for `owner`.
    ///
    /// Re-acquiring a lock already held by `owner` succeeds and refreshes the
    /// description when one is given.
    pub fn try_acquire(
        &mut self,
        owner: &Owner,
        description: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), LockError> {
        if self.locked {
            match &self.locked_by {
                Some(current) if current == owner => {}
                Some(current) => {
                    return Err(LockError::AlreadyLocked {
                        name: self.name.clone(),
                        current_owner: current.clone(),
                    });
                }
                None => {
                    // Unreachable while invariants hold; treat as free.
                }
            }
        }

        self.locked = true;
        self.locked_by = Some(owner.clone());
        if let Some(desc) = description {
            self.description = Some(desc.to_string());
        }
        self.last_updated = now;
        Ok(())
    }

    /// Drops the lock. `force` skips the ownership check.
    pub fn try_release(
        &mut self,
        owner: &Owner,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<(), LockError> {
        if !force && !self.is_held_by(owner) {
            return Err(LockError::NotOwner {
                name: self.name.clone(),
                owner: owner.clone(),
                current_owner: self.locked_by.clone(),
            });
        }

        self.locked = false;
        self.locked_by = None;
        self.last_updated = now;
        Ok(())
    }

    /// Applies registration attributes. Lock state is never touched.
    ///
    /// Returns `true` if anything changed (and `last_updated` was bumped).
    pub fn apply_attrs(&mut self, attrs: &MachineAttrs, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if self.up != attrs.up {
            self.up = attrs.up;
            changed = true;
        }
        if self.is_vm != attrs.is_vm {
            self.is_vm = attrs.is_vm;
            changed = true;
        }
        if self.vm_host != attrs.vm_host {
            self.vm_host = attrs.vm_host.clone();
            changed = true;
        }
        if self.mac_address != attrs.mac_address {
            self.mac_address = attrs.mac_address.clone();
            changed = true;
        }
        if attrs.description.is_some() && self.description != attrs.description {
            self.description = attrs.description.clone();
            changed = true;
        }

        if changed {
            self.last_updated = now;
        }
        changed
    }

    /// Applies a metadata update. Returns `true` if anything changed.
    pub fn apply_update(&mut self, update: &MachineUpdate, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if let Some(up) = update.up {
            if self.up != up {
                self.up = up;
                changed = true;
            }
        }
        if update.description.is_some() && self.description != update.description {
            self.description = update.description.clone();
            changed = true;
        }

        if changed {
            self.last_updated = now;
        }
        changed
    }

    /// Checks the invariants that can be verified on the record alone.
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        if self.locked != self.locked_by.is_some() {
            return Err(self.violation("locked_by must be set exactly when locked"));
        }
        if self.is_vm && self.vm_host.is_none() {
            return Err(self.violation("a VM requires a vm_host"));
        }
        if !self.is_vm && self.vm_host.is_some() {
            return Err(self.violation("vm_host is only valid for VMs"));
        }
        if self.vm_host.as_ref() == Some(&self.name) {
            return Err(self.violation("a VM cannot host itself"));
        }
        Ok(())
    }

    fn violation(&self, reason: &str) -> CoreError {
        CoreError::InvariantViolation {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Validates registration attributes against the referenced physical host.
///
/// `host` is the current record for `attrs.vm_host`, looked up by the caller.
pub fn validate_attrs(
    name: &MachineName,
    attrs: &MachineAttrs,
    host: Option<&MachineRecord>,
) -> Result<(), CoreError> {
    let violation = |reason: String| CoreError::InvariantViolation {
        name: name.clone(),
        reason,
    };

    match (&attrs.vm_host, attrs.is_vm) {
        (None, true) => Err(violation("a VM requires a vm_host".to_string())),
        (Some(_), false) => Err(violation("vm_host is only valid for VMs".to_string())),
        (None, false) => Ok(()),
        (Some(host_name), true) => {
            if host_name == name {
                return Err(violation("a VM cannot host itself".to_string()));
            }
            match host {
                None => Err(violation(format!("vm_host {} is not registered", host_name))),
                Some(record) if record.is_vm => Err(violation(format!(
                    "vm_host {} is itself a VM",
                    host_name
                ))),
                Some(_) => Ok(()),
            }
        }
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

    fn record(s: &str) -> MachineRecord {
        MachineRecord::new(name(s), MachineAttrs::physical(), Utc::now())
    }

    #[test]
    fn name_parts() {
        let n = name("ubuntu@plana01.front.example.com");
        assert_eq!(n.host(), "plana01.front.example.com");
        assert_eq!(n.shortname(), "plana01");

        let bare = name("mira042");
        assert_eq!(bare.host(), "mira042");
        assert_eq!(bare.shortname(), "mira042");
    }

    #[test]
    fn name_rejects_malformed_input() {
        assert!(MachineName::new("").is_err());
        assert!(MachineName::new("ubuntu@host one").is_err());
        assert!(MachineName::new("ubuntu@").is_err());
        for bad in ["ubuntu@mira/001", "ubuntu@mira001?x", "ubuntu@mira#1", "ubuntu@mira%2F1"] {
            assert!(MachineName::new(bad).is_err(), "{bad} accepted");
        }
        assert!(serde_json::from_str::<MachineName>("\"\"").is_err());
        assert!(Owner::new("   ").is_err());
    }

    #[test]
    fn acquire_is_exclusive_and_idempotent_for_the_holder() {
        let mut rec = record("ubuntu@plana01");
        let alice = owner("alice");
        let bob = owner("bob");

        rec.try_acquire(&alice, Some("run 1"), Utc::now()).unwrap();
        rec.try_acquire(&alice, None, Utc::now()).unwrap();
        assert_eq!(rec.description.as_deref(), Some("run 1"));

        let err = rec.try_acquire(&bob, None, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            LockError::AlreadyLocked {
                name: rec.name.clone(),
                current_owner: alice.clone(),
            }
        );
        assert!(rec.is_held_by(&alice));
        rec.check_invariants().unwrap();
    }

    #[test]
    fn release_requires_ownership_unless_forced() {
        let mut rec = record("ubuntu@plana01");
        let alice = owner("alice");
        let bob = owner("bob");
        rec.try_acquire(&alice, None, Utc::now()).unwrap();

        let err = rec.try_release(&bob, false, Utc::now()).unwrap_err();
        assert!(matches!(err, LockError::NotOwner { current_owner: Some(ref o), .. } if *o == alice));
        assert!(rec.locked);

        rec.try_release(&bob, true, Utc::now()).unwrap();
        assert!(!rec.locked);
        assert!(rec.locked_by.is_none());
        rec.check_invariants().unwrap();
    }

    #[test]
    fn release_of_unlocked_machine_by_owner_is_not_owner() {
        let mut rec = record("ubuntu@plana01");
        let err = rec.try_release(&owner("alice"), false, Utc::now()).unwrap_err();
        assert!(matches!(err, LockError::NotOwner { current_owner: None, .. }));
    }

    #[test]
    fn identical_attrs_do_not_change_the_record() {
        let mut rec = record("ubuntu@plana01");
        rec.try_acquire(&owner("alice"), None, Utc::now()).unwrap();
        let before = rec.clone();

        let changed = rec.apply_attrs(&MachineAttrs::physical(), Utc::now());
        assert!(!changed);
        assert_eq!(rec, before);
    }

    #[test]
    fn vm_attrs_need_a_physical_host() {
        let vm = name("ubuntu@vpm001");
        let host = record("ubuntu@mira001");
        let attrs = MachineAttrs::vm(host.name.clone(), Some("52:54:00:aa:bb:cc".into()));

        assert!(validate_attrs(&vm, &attrs, Some(&host)).is_ok());
        assert!(validate_attrs(&vm, &attrs, None).is_err());

        let mut vm_host = host.clone();
        vm_host.is_vm = true;
        assert!(validate_attrs(&vm, &attrs, Some(&vm_host)).is_err());

        let missing_host = MachineAttrs {
            is_vm: true,
            ..MachineAttrs::default()
        };
        assert!(validate_attrs(&vm, &missing_host, None).is_err());
    }

    #[test]
    fn filter_is_a_conjunction() {
        let mut rec = record("ubuntu@plana01");
        rec.try_acquire(&owner("alice"), None, Utc::now()).unwrap();

        let by_owner = MachineFilter {
            owner: Some(owner("alice")),
            ..Default::default()
        };
        assert!(by_owner.matches(&rec));

        let locked_and_down = MachineFilter {
            locked: Some(true),
            up: Some(false),
            ..Default::default()
        };
        assert!(!locked_and_down.matches(&rec));
        assert!(MachineFilter::default().matches(&rec));
    }
}
