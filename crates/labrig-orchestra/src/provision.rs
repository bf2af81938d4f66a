//! Creation and destruction of virtual test machines.
//!
//! [`create_if_vm`] and [`destroy_if_vm`] look the target up in the lock
//! service and only act on VMs; physical machines pass through untouched.
//! The [`Downburst`] backend drives the `downburst` tool against the VM's
//! physical host.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command as ProcessCommand;

use labrig_core::MachineName;

use crate::lock_client::{LockClient, LockClientError};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("provisioning {name} failed: {reason}")]
    ProvisionFailure { name: MachineName, reason: String },

    #[error(transparent)]
    Lock(#[from] LockClientError),
}

/// Default release for each known distro.
pub fn default_distro_version(distro: &str) -> Option<&'static str> {
    match distro {
        "ubuntu" => Some("12.04"),
        "fedora" => Some("18"),
        "centos" => Some("6.4"),
        "opensuse" => Some("12.2"),
        "sles" => Some("11-sp2"),
        "rhel" => Some("6.4"),
        "debian" => Some("7.0"),
        _ => None,
    }
}

/// Overrides for VM creation, usually from the `[downburst]` config table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DownburstOptions {
    /// Path to the downburst executable; `downburst` on PATH otherwise.
    pub executable: Option<PathBuf>,
    pub distro: Option<String>,
    pub distroversion: Option<String>,
    pub disk_size: Option<String>,
    pub ram: Option<String>,
    pub cpus: Option<u32>,
    pub additional_disks: Option<u32>,
    pub additional_disks_size: Option<String>,
    pub arch: Option<String>,
}

/// Everything needed to build one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: MachineName,
    pub vm_host: MachineName,
    pub mac_address: Option<String>,
    pub distro: String,
    pub distro_version: String,
    pub disk_size: String,
    pub ram: String,
    pub cpus: u32,
    pub additional_disks: u32,
    pub additional_disks_size: String,
    pub arch: String,
}

impl MachineSpec {
    /// Lab defaults with `options` applied on top.
    pub fn new(
        name: MachineName,
        vm_host: MachineName,
        mac_address: Option<String>,
        options: &DownburstOptions,
    ) -> Self {
        let distro = options
            .distro
            .clone()
            .unwrap_or_else(|| "ubuntu".to_string())
            .to_lowercase();
        let distro_version = options
            .distroversion
            .clone()
            .or_else(|| default_distro_version(&distro).map(str::to_string))
            .unwrap_or_default();

        MachineSpec {
            name,
            vm_host,
            mac_address,
            distro,
            distro_version,
            disk_size: options.disk_size.clone().unwrap_or_else(|| "100G".to_string()),
            ram: options.ram.clone().unwrap_or_else(|| "1.9G".to_string()),
            cpus: options.cpus.unwrap_or(1),
            additional_disks: options.additional_disks.unwrap_or(3),
            additional_disks_size: options
                .additional_disks_size
                .clone()
                .unwrap_or_else(|| "200G".to_string()),
            arch: options.arch.clone().unwrap_or_else(|| "x86_64".to_string()),
        }
    }

    /// The meta-data document handed to downburst. JSON is valid YAML.
    pub fn meta_data(&self) -> serde_json::Value {
        serde_json::json!({
            "downburst": {
                "disk-size": self.disk_size,
                "ram": self.ram,
                "cpus": self.cpus,
                "networks": [{ "source": "front", "mac": self.mac_address }],
                "distro": self.distro,
                "distroversion": self.distro_version,
                "additional-disks": self.additional_disks,
                "additional-disks-size": self.additional_disks_size,
                "arch": self.arch,
            },
            "local-hostname": self.name.host(),
        })
    }
}

/// Something that can build and tear down VMs.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Returns `false` when the backend ran but reported a failure.
    async fn create(&self, spec: &MachineSpec) -> Result<bool, ProvisionError>;

    async fn destroy(&self, name: &MachineName, vm_host: &MachineName)
        -> Result<bool, ProvisionError>;
}

/// The `downburst` VM tool.
#[derive(Debug, Clone)]
pub struct Downburst {
    executable: PathBuf,
}

impl Downburst {
    pub fn new(options: &DownburstOptions) -> Self {
        Downburst {
            executable: options
                .executable
                .clone()
                .unwrap_or_else(|| PathBuf::from("downburst")),
        }
    }

    async fn invoke(
        &self,
        name: &MachineName,
        args: &[String],
    ) -> Result<(bool, String, String), ProvisionError> {
        let output = ProcessCommand::new(&self.executable)
            .args(args)
            .output()
            .await
            .map_err(|err| ProvisionError::ProvisionFailure {
                name: name.clone(),
                reason: format!("could not run {}: {}", self.executable.display(), err),
            })?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    async fn create_once(&self, spec: &MachineSpec) -> Result<(bool, String), ProvisionError> {
        let failure = |reason: String| ProvisionError::ProvisionFailure {
            name: spec.name.clone(),
            reason,
        };

        let mut file = tempfile::NamedTempFile::new().map_err(|e| failure(e.to_string()))?;
        let doc = serde_json::to_vec_pretty(&spec.meta_data()).map_err(|e| failure(e.to_string()))?;
        file.write_all(&doc).map_err(|e| failure(e.to_string()))?;
        file.flush().map_err(|e| failure(e.to_string()))?;

        let args = vec![
            "-c".to_string(),
            spec.vm_host.shortname().to_string(),
            "create".to_string(),
            format!("--meta-data={}", file.path().display()),
            spec.name.shortname().to_string(),
        ];
        let (ok, stdout, stderr) = self.invoke(&spec.name, &args).await?;
        if stderr.is_empty() {
            tracing::info!("{} created: {}", spec.name, stdout.trim());
        } else {
            tracing::info!("downburst completed on {}: {}", spec.name, stderr.trim());
        }
        Ok((ok, stderr))
    }
}

#[async_trait]
impl ProvisioningBackend for Downburst {
    async fn create(&self, spec: &MachineSpec) -> Result<bool, ProvisionError> {
        let (ok, stderr) = self.create_once(spec).await?;
        if !stderr.contains("exists") {
            return Ok(ok);
        }

        tracing::info!("guest files exist, re-creating guest {}", spec.name);
        if !self.destroy(&spec.name, &spec.vm_host).await? {
            return Ok(false);
        }
        let (ok, _) = self.create_once(spec).await?;
        Ok(ok)
    }

    async fn destroy(
        &self,
        name: &MachineName,
        vm_host: &MachineName,
    ) -> Result<bool, ProvisionError> {
        let args = vec![
            "-c".to_string(),
            vm_host.shortname().to_string(),
            "destroy".to_string(),
            name.shortname().to_string(),
        ];
        let (ok, stdout, stderr) = self.invoke(name, &args).await?;
        if !ok || !stderr.trim().is_empty() {
            tracing::error!("destroying {} failed: {}", name, stderr.trim());
            return Ok(false);
        }
        tracing::info!("{} destroyed: {}", name, stdout.trim());
        Ok(true)
    }
}

/// Creates `name` if the lock service says it is a VM.
///
/// Returns `false` for physical machines.
pub async fn create_if_vm(
    locks: &dyn LockClient,
    backend: &dyn ProvisioningBackend,
    name: &MachineName,
    options: &DownburstOptions,
) -> Result<bool, ProvisionError> {
    let record = locks.status(name).await?;
    let (true, Some(vm_host)) = (record.is_vm, record.vm_host) else {
        return Ok(false);
    };
    let spec = MachineSpec::new(name.clone(), vm_host, record.mac_address, options);
    backend.create(&spec).await
}

/// Destroys `name` if the lock service says it is a VM.
///
/// Returns `true` for physical machines; `false` only when the backend
/// reported a failure.
pub async fn destroy_if_vm(
    locks: &dyn LockClient,
    backend: &dyn ProvisioningBackend,
    name: &MachineName,
) -> Result<bool, ProvisionError> {
    let record = locks.status(name).await?;
    let (true, Some(vm_host)) = (record.is_vm, record.vm_host) else {
        return Ok(true);
    };
    backend.destroy(name, &vm_host).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use labrig_core::MachineAttrs;
    use labrig_storage::{InMemoryStore, LockRegistry};

    use crate::lock_client::RegistryLockClient;

    #[derive(Default)]
    struct RecordingBackend {
        created: Mutex<Vec<MachineSpec>>,
        destroyed: Mutex<Vec<(MachineName, MachineName)>>,
    }

    #[async_trait]
    impl ProvisioningBackend for RecordingBackend {
        async fn create(&self, spec: &MachineSpec) -> Result<bool, ProvisionError> {
            self.created.lock().unwrap().push(spec.clone());
            Ok(true)
        }

        async fn destroy(
            &self,
            name: &MachineName,
            vm_host: &MachineName,
        ) -> Result<bool, ProvisionError> {
            self.destroyed
                .lock()
                .unwrap()
                .push((name.clone(), vm_host.clone()));
            Ok(true)
        }
    }

    fn name(s: &str) -> MachineName {
        MachineName::new(s).unwrap()
    }

    fn lab() -> RegistryLockClient {
        let store = InMemoryStore::new();
        store
            .register(&name("ubuntu@mira001.front.example.com"), &MachineAttrs::physical())
            .unwrap();
        store
            .register(
                &name("ubuntu@vpm001.front.example.com"),
                &MachineAttrs::vm(
                    name("ubuntu@mira001.front.example.com"),
                    Some("52:54:00:00:00:01".into()),
                ),
            )
            .unwrap();
        RegistryLockClient::new(Arc::new(store))
    }

    #[tokio::test]
    async fn physical_machines_are_left_alone() {
        let locks = lab();
        let backend = RecordingBackend::default();
        let host = name("ubuntu@mira001.front.example.com");

        assert!(!create_if_vm(&locks, &backend, &host, &DownburstOptions::default())
            .await
            .unwrap());
        assert!(destroy_if_vm(&locks, &backend, &host).await.unwrap());
        assert!(backend.created.lock().unwrap().is_empty());
        assert!(backend.destroyed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn vm_spec_uses_lab_defaults_and_registry_data() {
        let locks = lab();
        let backend = RecordingBackend::default();
        let vm = name("ubuntu@vpm001.front.example.com");
        let options = DownburstOptions {
            distro: Some("CentOS".into()),
            ..Default::default()
        };

        assert!(create_if_vm(&locks, &backend, &vm, &options).await.unwrap());
        let spec = backend.created.lock().unwrap()[0].clone();
        assert_eq!(spec.vm_host, name("ubuntu@mira001.front.example.com"));
        assert_eq!(spec.distro, "centos");
        assert_eq!(spec.distro_version, "6.4");
        assert_eq!(spec.disk_size, "100G");

        let meta = spec.meta_data();
        assert_eq!(meta["local-hostname"], "vpm001.front.example.com");
        assert_eq!(meta["downburst"]["networks"][0]["mac"], "52:54:00:00:00:01");
        assert_eq!(meta["downburst"]["additional-disks"], 3);
    }
}
