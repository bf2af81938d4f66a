//! `~/.labrig.toml` and the files a nuke run reads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use labrig_orchestra::{DownburstOptions, IpmiCredentials, NukeTimeouts};

pub const LOCK_SERVER_ENV: &str = "LABRIG_LOCK_SERVER";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("no lock server configured (set lock_server or LABRIG_LOCK_SERVER)")]
    NoLockServer,

    #[error("invalid {what} '{value}': {reason}")]
    Invalid {
        what: &'static str,
        value: String,
        reason: String,
    },
}

/// Step bounds in seconds; unset entries keep the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub command: Option<u64>,
    pub console_check: Option<u64>,
    pub console_ready: Option<u64>,
    pub reboot_reconnect: Option<u64>,
    pub reboot_settle: Option<u64>,
}

impl TimeoutsConfig {
    pub fn resolve(&self) -> NukeTimeouts {
        let defaults = NukeTimeouts::default();
        let secs = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        NukeTimeouts {
            command: secs(self.command, defaults.command),
            console_check: self
                .console_check
                .map(Duration::from_secs)
                .or(defaults.console_check),
            console_ready: secs(self.console_ready, defaults.console_ready),
            reboot_reconnect: secs(self.reboot_reconnect, defaults.reboot_reconnect),
            reboot_settle: secs(self.reboot_settle, defaults.reboot_settle),
        }
    }
}

/// User configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root URL of the lock server.
    pub lock_server: Option<String>,
    pub testdir_base: Option<String>,
    pub ipmi_user: Option<String>,
    pub ipmi_password: Option<String>,
    pub ipmi_domain: Option<String>,
    /// Pause for the operator before tearing down a failed target.
    pub interactive_on_error: bool,
    pub max_parallelism: Option<usize>,
    pub downburst: Option<DownburstOptions>,
    pub timeouts: TimeoutsConfig,
}

impl Config {
    /// Loads `path`, or `~/.labrig.toml` when no path is given.
    ///
    /// A missing default file yields the default configuration; a missing
    /// explicit file is an error. `LABRIG_LOCK_SERVER` overrides
    /// `lock_server` either way.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Config::default(),
            },
        };
        if let Ok(server) = std::env::var(LOCK_SERVER_ENV) {
            if !server.is_empty() {
                config.lock_server = Some(server);
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn lock_server(&self) -> Result<&str, ConfigError> {
        self.lock_server.as_deref().ok_or(ConfigError::NoLockServer)
    }

    /// IPMI credentials, when all three settings are present.
    pub fn ipmi(&self) -> Option<IpmiCredentials> {
        match (&self.ipmi_user, &self.ipmi_password, &self.ipmi_domain) {
            (Some(user), Some(password), Some(domain)) => Some(IpmiCredentials {
                user: user.clone(),
                password: password.clone(),
                domain: domain.clone(),
            }),
            _ => None,
        }
    }
}

fn default_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".labrig.toml"))
}

#[derive(Debug, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: BTreeMap<String, String>,
}

/// Reads the `[targets]` table (machine name to host key) of a TOML file.
pub fn load_targets(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: TargetsFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(file.targets)
}

/// What a job archive directory tells a nuke run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobArchive {
    pub owner: String,
    pub pid: Option<i32>,
    pub targets: BTreeMap<String, String>,
}

impl JobArchive {
    /// Reads `owner`, `pid` (optional) and the targets of `config.toml`.
    pub fn load(dir: &Path) -> Result<JobArchive, ConfigError> {
        let read = |file: &str| {
            let path = dir.join(file);
            std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })
        };

        let owner = read("owner")?.trim().to_string();
        let pid = match read("pid") {
            Ok(text) => {
                let text = text.trim();
                Some(text.parse::<i32>().map_err(|err| ConfigError::Invalid {
                    what: "pid",
                    value: text.to_string(),
                    reason: err.to_string(),
                })?)
            }
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                None
            }
            Err(err) => return Err(err),
        };
        let targets = load_targets(&dir.join("config.toml"))?;

        Ok(JobArchive {
            owner,
            pid,
            targets,
        })
    }
}
