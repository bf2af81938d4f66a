//! `ssh`-binary backed sessions.
//!
//! Every command is rendered to one shell line and run through
//! `ssh -o BatchMode=yes`. ssh exits 255 on its own failures, but so can the
//! remote command. A 255 is reported as [`RemoteError::ConnectionLost`] only
//! when ssh's stderr names a transport failure; otherwise it is the command's
//! exit status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as ProcessCommand;

use labrig_core::{Command, MachineName};

use crate::remote::{
    ProcessOutput, RemoteError, RemoteHostSession, RemoteProcess, SessionConnector,
};

const SSH_FAILURE_STATUS: i32 = 255;

/// stderr fragments ssh prints when the connection itself failed.
const TRANSPORT_FAILURES: &[&str] = &[
    "ssh: ",
    "Connection closed by",
    "Connection reset by",
    "Connection timed out",
    "Connection refused",
    "Permission denied (",
    "Host key verification failed",
    "Broken pipe",
    "client_loop: ",
    "kex_exchange_identification",
];

fn is_transport_failure(stderr: &str) -> bool {
    stderr
        .lines()
        .any(|line| TRANSPORT_FAILURES.iter().any(|marker| line.contains(marker)))
}

/// Opens [`SshSession`]s, verifying each host answers first.
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub connect_timeout: Duration,
    /// Bound on the initial `true` probe.
    pub probe_timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        SshConnector {
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, name: &MachineName) -> Result<Arc<dyn RemoteHostSession>, RemoteError> {
        let session = SshSession::new(name.clone(), self.connect_timeout);
        session
            .run_wait(&Command::new("true"), Some(self.probe_timeout))
            .await
            .map_err(|err| RemoteError::ConnectionLost {
                host: name.clone(),
                reason: err.to_string(),
            })?;
        tracing::debug!("connected to {}", name);
        Ok(Arc::new(session))
    }
}

/// A session to one host through the `ssh` binary.
pub struct SshSession {
    name: MachineName,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl SshSession {
    pub fn new(name: MachineName, connect_timeout: Duration) -> Self {
        SshSession {
            name,
            connect_timeout,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteHostSession for SshSession {
    fn name(&self) -> &MachineName {
        &self.name
    }

    fn run(&self, command: &Command) -> RemoteProcess {
        let host = self.name.clone();
        let line = command.render();
        tracing::debug!(host = %host, "running: {}", line);

        if self.closed.load(Ordering::SeqCst) {
            return RemoteProcess::completed(
                host.clone(),
                command,
                Err(RemoteError::ConnectionLost {
                    host,
                    reason: "session closed".to_string(),
                }),
            );
        }

        let mut ssh = ProcessCommand::new("ssh");
        ssh.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(host.as_str())
            .arg(&line);

        let work_host = host.clone();
        RemoteProcess::spawn(host, command, async move {
            let output = ssh.output().await.map_err(|err| RemoteError::CommandCrashed {
                host: work_host.clone(),
                command: line.clone(),
                reason: format!("could not start ssh: {}", err),
            })?;
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            match output.status.code() {
                Some(SSH_FAILURE_STATUS) if is_transport_failure(&stderr) => {
                    Err(RemoteError::ConnectionLost {
                        host: work_host,
                        reason: stderr.trim().to_string(),
                    })
                }
                Some(status) => Ok(ProcessOutput {
                    status,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr,
                }),
                None => Err(RemoteError::CommandCrashed {
                    host: work_host,
                    command: line,
                    reason: "terminated by signal".to_string(),
                }),
            }
        })
    }

    async fn reconnect(&self, timeout: Duration) -> Result<(), RemoteError> {
        self.closed.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        let probe = Command::new("true");
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RemoteError::ConnectionLost {
                    host: self.name.clone(),
                    reason: format!("not reachable within {:?}", timeout),
                });
            }
            match self.run_wait(&probe, Some(remaining)).await {
                Ok(_) => {
                    tracing::info!("reconnected to {}", self.name);
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!("{} not back yet: {}", self.name, err);
                    tokio::time::sleep(Duration::from_secs(1).min(remaining)).await;
                }
            }
        }
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
