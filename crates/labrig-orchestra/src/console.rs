//! Out-of-band consoles used to power hosts on and off.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as ProcessCommand;

use labrig_core::MachineName;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsoleError {
    #[error("console command for {host} failed: {reason}")]
    Command { host: String, reason: String },

    #[error("console for {host} not ready after {timeout:?}")]
    NotReady { host: String, timeout: Duration },
}

/// Power and status control for one host.
#[async_trait]
pub trait Console: Send + Sync {
    /// The console's address, for log messages.
    fn host(&self) -> &str;

    /// Whether the host is powered on. With a timeout, polls until it is
    /// or the bound expires; without, checks once.
    async fn check_status(&self, timeout: Option<Duration>) -> bool;

    async fn power_on(&self) -> Result<(), ConsoleError>;

    /// Power-cycles the host and waits up to `wait` for it to come back.
    async fn power_cycle(&self, wait: Duration) -> Result<(), ConsoleError>;
}

/// Hands out the console for a target.
pub trait ConsoleFactory: Send + Sync {
    fn console_for(&self, name: &MachineName) -> Arc<dyn Console>;
}

/// IPMI login, shared by every console in a lab.
#[derive(Debug, Clone)]
pub struct IpmiCredentials {
    pub user: String,
    pub password: String,
    pub domain: String,
}

/// Console driven through `ipmitool` over the LAN interface.
pub struct IpmiConsole {
    host: String,
    credentials: IpmiCredentials,
}

impl IpmiConsole {
    /// The console of `name` lives at `{shortname}.{domain}`.
    pub fn new(name: &MachineName, credentials: IpmiCredentials) -> Self {
        IpmiConsole {
            host: format!("{}.{}", name.shortname(), credentials.domain),
            credentials,
        }
    }

    async fn ipmitool(&self, args: &[&str]) -> Result<String, ConsoleError> {
        let output = ProcessCommand::new("ipmitool")
            .args(["-H", self.host.as_str(), "-I", "lanplus"])
            .args([
                "-U",
                self.credentials.user.as_str(),
                "-P",
                self.credentials.password.as_str(),
            ])
            .args(args)
            .output()
            .await
            .map_err(|err| ConsoleError::Command {
                host: self.host.clone(),
                reason: err.to_string(),
            })?;

        if !output.status.success() {
            return Err(ConsoleError::Command {
                host: self.host.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn is_powered_on(&self) -> bool {
        match self.ipmitool(&["chassis", "power", "status"]).await {
            Ok(status) => status.trim().ends_with("on"),
            Err(err) => {
                tracing::debug!("{}", err);
                false
            }
        }
    }
}

#[async_trait]
impl Console for IpmiConsole {
    fn host(&self) -> &str {
        &self.host
    }

    async fn check_status(&self, timeout: Option<Duration>) -> bool {
        let Some(timeout) = timeout else {
            return self.is_powered_on().await;
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_powered_on().await {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL.min(remaining)).await;
        }
    }

    async fn power_on(&self) -> Result<(), ConsoleError> {
        tracing::info!("powering on {}", self.host);
        self.ipmitool(&["chassis", "power", "on"]).await.map(|_| ())
    }

    async fn power_cycle(&self, wait: Duration) -> Result<(), ConsoleError> {
        tracing::info!("power cycling {}", self.host);
        self.ipmitool(&["chassis", "power", "cycle"]).await?;
        if self.check_status(Some(wait)).await {
            Ok(())
        } else {
            Err(ConsoleError::NotReady {
                host: self.host.clone(),
                timeout: wait,
            })
        }
    }
}

/// Builds [`IpmiConsole`]s from lab-wide credentials.
#[derive(Debug, Clone)]
pub struct IpmiConsoleFactory {
    credentials: IpmiCredentials,
}

impl IpmiConsoleFactory {
    pub fn new(credentials: IpmiCredentials) -> Self {
        IpmiConsoleFactory { credentials }
    }
}

impl ConsoleFactory for IpmiConsoleFactory {
    fn console_for(&self, name: &MachineName) -> Arc<dyn Console> {
        Arc::new(IpmiConsole::new(name, self.credentials.clone()))
    }
}
