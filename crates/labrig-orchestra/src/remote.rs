//! Remote host sessions.
//!
//! A [`RemoteHostSession`] starts commands on one host and hands back a
//! [`RemoteProcess`] for each. The process runs on its own tokio task: the
//! caller can wait for it with or without a bound, and a wait that times out
//! leaves the remote work running (abandoned, never killed).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use labrig_core::{Command, MachineName};

/// Failures of a remote command or session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The transport to the host failed.
    #[error("connection to {host} lost: {reason}")]
    ConnectionLost { host: MachineName, reason: String },

    /// The command ran and exited non-zero.
    #[error("command failed on {host} with status {status}: {command}")]
    CommandFailed {
        host: MachineName,
        command: String,
        status: i32,
    },

    /// The command did not finish within the bound.
    #[error("command timed out on {host} after {timeout:?}: {command}")]
    CommandTimedOut {
        host: MachineName,
        command: String,
        timeout: Duration,
    },

    /// The command ended abnormally (signal, panic, spawn failure).
    #[error("command crashed on {host}: {command}: {reason}")]
    CommandCrashed {
        host: MachineName,
        command: String,
        reason: String,
    },
}

impl RemoteError {
    /// True for failures after which the host state is unknown: a hung
    /// command or a dropped connection.
    pub fn is_hang(&self) -> bool {
        matches!(
            self,
            RemoteError::CommandTimedOut { .. } | RemoteError::ConnectionLost { .. }
        )
    }
}

/// What a finished command left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A command started on a remote host.
pub struct RemoteProcess {
    host: MachineName,
    command: String,
    handle: Option<JoinHandle<Result<ProcessOutput, RemoteError>>>,
    finished: Option<Result<ProcessOutput, RemoteError>>,
}

impl RemoteProcess {
    /// Runs `work` on its own task as the execution of `command`.
    pub fn spawn<F>(host: MachineName, command: &Command, work: F) -> Self
    where
        F: std::future::Future<Output = Result<ProcessOutput, RemoteError>> + Send + 'static,
    {
        RemoteProcess {
            host,
            command: command.render(),
            handle: Some(tokio::spawn(work)),
            finished: None,
        }
    }

    /// A process that has already ended with `result`.
    pub fn completed(
        host: MachineName,
        command: &Command,
        result: Result<ProcessOutput, RemoteError>,
    ) -> Self {
        RemoteProcess {
            host,
            command: command.render(),
            handle: None,
            finished: Some(result),
        }
    }

    pub fn host(&self) -> &MachineName {
        &self.host
    }

    /// The rendered command line.
    pub fn command(&self) -> &str {
        &self.command
    }

    async fn settle(&mut self, timeout: Option<Duration>) -> Result<&ProcessOutput, RemoteError> {
        if self.finished.is_none() {
            let Some(handle) = self.handle.as_mut() else {
                return Err(self.crashed("process has no task".to_string()));
            };
            let joined = match timeout {
                Some(bound) => match tokio::time::timeout(bound, handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        return Err(RemoteError::CommandTimedOut {
                            host: self.host.clone(),
                            command: self.command.clone(),
                            timeout: bound,
                        });
                    }
                },
                None => handle.await,
            };
            self.handle = None;
            self.finished = Some(match joined {
                Ok(result) => result,
                Err(err) => Err(self.crashed(err.to_string())),
            });
        }

        match &self.finished {
            Some(Ok(output)) => Ok(output),
            Some(Err(err)) => Err(err.clone()),
            None => Err(self.crashed("process result missing".to_string())),
        }
    }

    fn crashed(&self, reason: String) -> RemoteError {
        RemoteError::CommandCrashed {
            host: self.host.clone(),
            command: self.command.clone(),
            reason,
        }
    }

    /// Waits for the exit status. A non-zero status is returned, not raised.
    pub async fn exit_status(&mut self, timeout: Option<Duration>) -> Result<i32, RemoteError> {
        self.settle(timeout).await.map(|output| output.status)
    }

    /// Waits for the command and fails on a non-zero exit status.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ProcessOutput, RemoteError> {
        let output = self.settle(timeout).await?.clone();
        if output.status != 0 {
            return Err(RemoteError::CommandFailed {
                host: self.host.clone(),
                command: self.command.clone(),
                status: output.status,
            });
        }
        Ok(output)
    }

    /// Standard output, once the process has finished.
    pub fn stdout(&self) -> Option<&str> {
        match &self.finished {
            Some(Ok(output)) => Some(&output.stdout),
            _ => None,
        }
    }
}

/// An open connection to one host.
#[async_trait]
pub trait RemoteHostSession: Send + Sync {
    fn name(&self) -> &MachineName;

    /// Starts `command` without waiting for it.
    fn run(&self, command: &Command) -> RemoteProcess;

    /// Starts `command` and waits for it to exit zero within `timeout`.
    async fn run_wait(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, RemoteError> {
        self.run(command).wait(timeout).await
    }

    /// Re-establishes the connection, polling until it works or `timeout`
    /// expires.
    async fn reconnect(&self, timeout: Duration) -> Result<(), RemoteError>;

    async fn close(&self) -> Result<(), RemoteError>;
}

/// Opens sessions to hosts.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, name: &MachineName) -> Result<Arc<dyn RemoteHostSession>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> MachineName {
        MachineName::new("ubuntu@mira001").unwrap()
    }

    #[tokio::test]
    async fn timed_out_wait_can_be_retried() {
        let cmd = Command::new("sleep").arg("1");
        let mut proc = RemoteProcess::spawn(host(), &cmd, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ProcessOutput::default())
        });

        let err = proc
            .exit_status(Some(Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::CommandTimedOut { .. }));
        assert!(err.is_hang());

        assert_eq!(proc.exit_status(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wait_raises_on_nonzero_status_but_exit_status_does_not() {
        let cmd = Command::new("false");
        let mut proc = RemoteProcess::completed(
            host(),
            &cmd,
            Ok(ProcessOutput {
                status: 1,
                ..Default::default()
            }),
        );
        assert_eq!(proc.exit_status(None).await.unwrap(), 1);
        let err = proc.wait(None).await.unwrap_err();
        assert!(matches!(err, RemoteError::CommandFailed { status: 1, .. }));
    }

    #[tokio::test]
    async fn panicking_work_is_a_crash() {
        let cmd = Command::new("true");
        let broken = true;
        let mut proc = RemoteProcess::spawn(host(), &cmd, async move {
            if broken {
                panic!("transport bug");
            }
            Ok(ProcessOutput::default())
        });
        let err = proc.wait(None).await.unwrap_err();
        assert!(matches!(err, RemoteError::CommandCrashed { .. }));
    }
}
