//! Schema types for the lock API.

use serde::{Deserialize, Serialize};

use labrig_core::MachineRecord;

/// `POST /lock` body.
///
/// Either `machines` (lock these names) or `count` (lock any N free
/// machines, optionally restricted by `is_vm`) must be given.
#[derive(Debug, Clone, Deserialize)]
pub struct LockManyRequest {
    #[serde(default)]
    pub machines: Option<Vec<String>>,
    #[serde(default)]
    pub count: Option<usize>,
    pub owner: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_vm: Option<bool>,
}

/// Per-machine outcome of a bulk lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineLockStatus {
    Locked,
    AlreadyLocked,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineLockResult {
    pub name: String,
    pub status: MachineLockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_owner: Option<String>,
}

/// Response to `POST /lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockManyResponse {
    /// True when every requested machine is now held by the caller.
    pub all_locked: bool,
    pub results: Vec<MachineLockResult>,
    /// Records of the machines locked by this request.
    pub machines: Vec<MachineRecord>,
}

/// `POST /lock/{name}` body.
#[derive(Debug, Clone, Deserialize)]
pub struct SetLockRequest {
    pub locked: bool,
    pub owner: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub force: bool,
}

/// `GET /lock` query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListLocksQuery {
    pub owner: Option<String>,
    pub locked: Option<bool>,
    pub up: Option<bool>,
    pub is_vm: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListLocksResponse {
    pub machines: Vec<MachineRecord>,
}
