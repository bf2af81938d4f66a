//! Clients of the lock service.
//!
//! [`HttpLockClient`] talks to a running `labrig-server`;
//! [`RegistryLockClient`] calls a [`LockRegistry`] in-process. Both report
//! refused operations as [`LockError`]s so callers match on one taxonomy.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use labrig_core::{
    LockError, MachineAttrs, MachineFilter, MachineName, MachineRecord, MachineUpdate, Owner,
};
use labrig_storage::{LockRegistry, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum LockClientError {
    /// The lock service refused the operation.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The lock service answered with an error outside the lock taxonomy.
    #[error("lock service error {status} {code}: {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    /// The request never got a usable answer.
    #[error("lock service unreachable: {0}")]
    Transport(String),

    /// The in-process registry failed.
    #[error("registry error: {0}")]
    Backend(String),
}

impl From<reqwest::Error> for LockClientError {
    fn from(err: reqwest::Error) -> Self {
        LockClientError::Transport(err.to_string())
    }
}

impl From<StorageError> for LockClientError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Lock(lock) => LockClientError::Lock(lock),
            other => LockClientError::Backend(other.to_string()),
        }
    }
}

/// Operations on the lock service.
#[async_trait]
pub trait LockClient: Send + Sync {
    async fn status(&self, name: &MachineName) -> Result<MachineRecord, LockClientError>;

    async fn acquire(
        &self,
        name: &MachineName,
        owner: &Owner,
        description: Option<&str>,
    ) -> Result<MachineRecord, LockClientError>;

    /// Locks any `count` free machines, all or nothing.
    async fn acquire_many(
        &self,
        count: usize,
        owner: &Owner,
        description: Option<&str>,
        is_vm: Option<bool>,
    ) -> Result<Vec<MachineRecord>, LockClientError>;

    async fn release(
        &self,
        name: &MachineName,
        owner: &Owner,
        force: bool,
    ) -> Result<MachineRecord, LockClientError>;

    async fn list(&self, filter: &MachineFilter) -> Result<Vec<MachineRecord>, LockClientError>;

    async fn register(
        &self,
        name: &MachineName,
        attrs: &MachineAttrs,
    ) -> Result<MachineRecord, LockClientError>;

    async fn update(
        &self,
        name: &MachineName,
        update: &MachineUpdate,
    ) -> Result<MachineRecord, LockClientError>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MachineList {
    machines: Vec<MachineRecord>,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    machine: MachineRecord,
}

/// Client for the lock server's JSON API.
#[derive(Debug, Clone)]
pub struct HttpLockClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpLockClient {
    /// `base_url` is the server root, e.g. `http://locks.example.com:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        HttpLockClient {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn machine_url(&self, name: &MachineName) -> String {
        self.url(&format!("/lock/{}", name))
    }

    /// Decodes a success body, or maps the error envelope back to the lock
    /// taxonomy. `subject` and `owner` fill in what the envelope omits.
    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
        subject: Option<&MachineName>,
        owner: Option<&Owner>,
    ) -> Result<T, LockClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await?;
        let body = match serde_json::from_str::<ErrorEnvelope>(&text) {
            Ok(envelope) => envelope.error,
            Err(_) => {
                return Err(LockClientError::Rejected {
                    status: status.as_u16(),
                    code: String::new(),
                    message: text,
                })
            }
        };
        Err(map_error(status, body, subject, owner))
    }
}

fn map_error(
    status: StatusCode,
    body: ErrorBody,
    subject: Option<&MachineName>,
    owner: Option<&Owner>,
) -> LockClientError {
    let detail = |key: &str| body.details.as_ref().and_then(|d| d.get(key).cloned());
    let rejected = |body: ErrorBody| LockClientError::Rejected {
        status: status.as_u16(),
        code: body.code,
        message: body.message,
    };

    let lock = match (body.code.as_str(), subject) {
        ("ALREADY_LOCKED", Some(name)) => detail("current_owner")
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|o| Owner::new(o).ok())
            .map(|current_owner| LockError::AlreadyLocked {
                name: name.clone(),
                current_owner,
            }),
        ("NOT_OWNER", Some(name)) => owner.map(|owner| LockError::NotOwner {
            name: name.clone(),
            owner: owner.clone(),
            current_owner: None,
        }),
        ("NOT_FOUND", Some(name)) => Some(LockError::NotFound(name.clone())),
        ("INSUFFICIENT_MACHINES", _) => {
            let requested = detail("requested").and_then(|v| v.as_u64());
            let available = detail("available").and_then(|v| v.as_u64());
            match (requested, available) {
                (Some(requested), Some(available)) => Some(LockError::InsufficientMachines {
                    requested: requested as usize,
                    available: available as usize,
                }),
                _ => None,
            }
        }
        _ => None,
    };

    match lock {
        Some(lock) => LockClientError::Lock(lock),
        None => rejected(body),
    }
}

#[async_trait]
impl LockClient for HttpLockClient {
    async fn status(&self, name: &MachineName) -> Result<MachineRecord, LockClientError> {
        let response = self.http.get(self.machine_url(name)).send().await?;
        Self::decode(response, Some(name), None).await
    }

    async fn acquire(
        &self,
        name: &MachineName,
        owner: &Owner,
        description: Option<&str>,
    ) -> Result<MachineRecord, LockClientError> {
        let response = self
            .http
            .post(self.machine_url(name))
            .json(&json!({ "locked": true, "owner": owner, "description": description }))
            .send()
            .await?;
        Self::decode(response, Some(name), Some(owner)).await
    }

    async fn acquire_many(
        &self,
        count: usize,
        owner: &Owner,
        description: Option<&str>,
        is_vm: Option<bool>,
    ) -> Result<Vec<MachineRecord>, LockClientError> {
        let response = self
            .http
            .post(self.url("/lock"))
            .json(&json!({
                "count": count,
                "owner": owner,
                "description": description,
                "is_vm": is_vm,
            }))
            .send()
            .await?;
        let list: MachineList = Self::decode(response, None, Some(owner)).await?;
        Ok(list.machines)
    }

    async fn release(
        &self,
        name: &MachineName,
        owner: &Owner,
        force: bool,
    ) -> Result<MachineRecord, LockClientError> {
        let response = self
            .http
            .post(self.machine_url(name))
            .json(&json!({ "locked": false, "owner": owner, "force": force }))
            .send()
            .await?;
        Self::decode(response, Some(name), Some(owner)).await
    }

    async fn list(&self, filter: &MachineFilter) -> Result<Vec<MachineRecord>, LockClientError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(owner) = &filter.owner {
            query.push(("owner", owner.to_string()));
        }
        if let Some(locked) = filter.locked {
            query.push(("locked", locked.to_string()));
        }
        if let Some(up) = filter.up {
            query.push(("up", up.to_string()));
        }
        if let Some(is_vm) = filter.is_vm {
            query.push(("is_vm", is_vm.to_string()));
        }

        let response = self.http.get(self.url("/lock")).query(&query).send().await?;
        let list: MachineList = Self::decode(response, None, None).await?;
        Ok(list.machines)
    }

    async fn register(
        &self,
        name: &MachineName,
        attrs: &MachineAttrs,
    ) -> Result<MachineRecord, LockClientError> {
        let mut body = serde_json::to_value(attrs)
            .map_err(|err| LockClientError::Transport(err.to_string()))?;
        body["name"] = json!(name);
        let response = self.http.post(self.url("/add")).json(&body).send().await?;
        let added: AddResponse = Self::decode(response, Some(name), None).await?;
        Ok(added.machine)
    }

    async fn update(
        &self,
        name: &MachineName,
        update: &MachineUpdate,
    ) -> Result<MachineRecord, LockClientError> {
        let response = self
            .http
            .put(self.machine_url(name))
            .json(update)
            .send()
            .await?;
        Self::decode(response, Some(name), None).await
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Lock client over a registry in the same process.
#[derive(Clone)]
pub struct RegistryLockClient {
    registry: Arc<dyn LockRegistry>,
}

impl RegistryLockClient {
    pub fn new(registry: Arc<dyn LockRegistry>) -> Self {
        RegistryLockClient { registry }
    }
}

#[async_trait]
impl LockClient for RegistryLockClient {
    async fn status(&self, name: &MachineName) -> Result<MachineRecord, LockClientError> {
        Ok(self.registry.get(name)?)
    }

    async fn acquire(
        &self,
        name: &MachineName,
        owner: &Owner,
        description: Option<&str>,
    ) -> Result<MachineRecord, LockClientError> {
        Ok(self.registry.acquire(name, owner, description)?)
    }

    async fn acquire_many(
        &self,
        count: usize,
        owner: &Owner,
        description: Option<&str>,
        is_vm: Option<bool>,
    ) -> Result<Vec<MachineRecord>, LockClientError> {
        let filter = MachineFilter {
            is_vm,
            ..Default::default()
        };
        Ok(self
            .registry
            .acquire_many(count, owner, description, &filter)?)
    }

    async fn release(
        &self,
        name: &MachineName,
        owner: &Owner,
        force: bool,
    ) -> Result<MachineRecord, LockClientError> {
        Ok(self.registry.release(name, owner, force)?)
    }

    async fn list(&self, filter: &MachineFilter) -> Result<Vec<MachineRecord>, LockClientError> {
        Ok(self.registry.query(filter)?)
    }

    async fn register(
        &self,
        name: &MachineName,
        attrs: &MachineAttrs,
    ) -> Result<MachineRecord, LockClientError> {
        Ok(self.registry.register(name, attrs)?.record)
    }

    async fn update(
        &self,
        name: &MachineName,
        update: &MachineUpdate,
    ) -> Result<MachineRecord, LockClientError> {
        Ok(self.registry.update(name, update)?)
    }
}
