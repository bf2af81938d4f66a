//! Cleaning one target.
//!
//! The lock check runs first. The console and the remote session are then
//! entered as nested scopes, and the body walks the remaining steps in
//! order. Only a failed lock check, a failed connection or a failed reboot
//! end the target early; every other step is best effort and at worst
//! flags the host for a reboot.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use labrig_core::{Command, MachineName};

use crate::console::Console;
use crate::contextutil::{NestedScopes, Release};
use crate::remote::{ProcessOutput, RemoteError, RemoteHostSession, SessionConnector};

use super::{steps, NukeContext, NukeJob, NukeTimeouts};

/// The stages a target passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NukeStep {
    CheckLock,
    Connect,
    ShutdownDaemons,
    UnmountOsdMounts,
    UnmountTmpfs,
    HandleKernelMounts,
    RebootIfNeeded,
    SyncClocks,
    ResetSyslog,
    ClearFilesystem,
}

impl fmt::Display for NukeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NukeStep::CheckLock => "check lock",
            NukeStep::Connect => "connect",
            NukeStep::ShutdownDaemons => "shutdown daemons",
            NukeStep::UnmountOsdMounts => "unmount osd mounts",
            NukeStep::UnmountTmpfs => "unmount tmpfs",
            NukeStep::HandleKernelMounts => "handle kernel mounts",
            NukeStep::RebootIfNeeded => "reboot",
            NukeStep::SyncClocks => "sync clocks",
            NukeStep::ResetSyslog => "reset syslog",
            NukeStep::ClearFilesystem => "clear filesystem",
        };
        f.write_str(name)
    }
}

/// Why a target could not be cleaned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    /// `None` when the failure happened outside any step (a panic).
    pub step: Option<NukeStep>,
    pub reason: String,
}

impl TargetFailure {
    pub fn at(step: NukeStep, reason: impl fmt::Display) -> Self {
        TargetFailure {
            step: Some(step),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "{}: {}", step, self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

impl std::error::Error for TargetFailure {}

/// What happened to a target that was cleaned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetOutcome {
    pub rebooted: bool,
    pub clocks_synced: bool,
    /// Set when a step hung but the host was not rebooted.
    pub needs_reboot: bool,
}

enum TargetScope {
    Console,
    Session(Arc<dyn RemoteHostSession>),
}

pub(crate) async fn nuke_target(
    ctx: &NukeContext,
    job: &NukeJob,
    name: &MachineName,
) -> Result<TargetOutcome, TargetFailure> {
    if job.check_locks {
        check_lock(ctx, job, name).await?;
    }

    let console_slot: Arc<OnceLock<Arc<dyn Console>>> = Arc::new(OnceLock::new());

    let console_scope = {
        let consoles = ctx.consoles.clone();
        let slot = Arc::clone(&console_slot);
        let name = name.clone();
        let timeouts = ctx.timeouts.clone();
        move || async move {
            if let Some(factory) = consoles {
                let console = factory.console_for(&name);
                if prepare_console(console.as_ref(), &timeouts).await {
                    let _ = slot.set(console);
                }
            }
            Ok((TargetScope::Console, Release::noop()))
        }
    };

    let session_scope = {
        let connector = Arc::clone(&ctx.connector);
        let slot = Arc::clone(&console_slot);
        let name = name.clone();
        let timeouts = ctx.timeouts.clone();
        move || async move {
            let console = slot.get().cloned();
            let session = connect(connector.as_ref(), &name, console, &timeouts).await?;
            let closing = Arc::clone(&session);
            let release = Release::new(move || async move {
                if let Err(err) = closing.close().await {
                    tracing::warn!("closing session to {} failed: {}", closing.name(), err);
                }
                Ok(())
            });
            Ok((TargetScope::Session(session), release))
        }
    };

    NestedScopes::new()
        .scope("console", console_scope)
        .scope("session", session_scope)
        .with_operator_hook(ctx.operator_hook.clone())
        .run(|scopes| async move {
            let session = scopes
                .into_iter()
                .find_map(|scope| match scope {
                    TargetScope::Session(session) => Some(session),
                    TargetScope::Console => None,
                })
                .ok_or_else(|| TargetFailure::at(NukeStep::Connect, "no session"))?;
            TargetRun::new(ctx, job, name, session).run().await
        })
        .await
}

async fn check_lock(
    ctx: &NukeContext,
    job: &NukeJob,
    name: &MachineName,
) -> Result<(), TargetFailure> {
    let record = ctx
        .locks
        .status(name)
        .await
        .map_err(|err| TargetFailure::at(NukeStep::CheckLock, err))?;
    match &record.locked_by {
        Some(holder) if *holder == job.owner => Ok(()),
        Some(holder) => Err(TargetFailure::at(
            NukeStep::CheckLock,
            format!("locked by {}, not {}", holder, job.owner),
        )),
        None => Err(TargetFailure::at(NukeStep::CheckLock, "not locked")),
    }
}

/// Makes sure the host is powered on. Returns `false` if the console should
/// not be used for this run.
async fn prepare_console(console: &dyn Console, timeouts: &NukeTimeouts) -> bool {
    if console.check_status(timeouts.console_check).await {
        return true;
    }
    tracing::info!("{} reports power off, powering on", console.host());
    if let Err(err) = console.power_on().await {
        tracing::warn!("{}", err);
    }
    if console.check_status(Some(timeouts.console_ready)).await {
        return true;
    }
    tracing::error!(
        "console {} not ready after {:?}, disabling it",
        console.host(),
        timeouts.console_ready
    );
    false
}

async fn connect(
    connector: &dyn SessionConnector,
    name: &MachineName,
    console: Option<Arc<dyn Console>>,
    timeouts: &NukeTimeouts,
) -> Result<Arc<dyn RemoteHostSession>, TargetFailure> {
    let err = match connector.connect(name).await {
        Ok(session) => return Ok(session),
        Err(err) => err,
    };
    let Some(console) = console else {
        return Err(TargetFailure::at(NukeStep::Connect, err));
    };

    tracing::warn!("{} unreachable ({}), powering on through the console", name, err);
    if let Err(err) = console.power_on().await {
        tracing::warn!("{}", err);
    }
    if !console.check_status(Some(timeouts.console_ready)).await {
        tracing::warn!("console {} still not ready", console.host());
    }
    connector
        .connect(name)
        .await
        .map_err(|err| TargetFailure::at(NukeStep::Connect, err))
}

/// State of one target while its steps run.
struct TargetRun<'a> {
    ctx: &'a NukeContext,
    job: &'a NukeJob,
    name: &'a MachineName,
    session: Arc<dyn RemoteHostSession>,
    testdir: String,
    needs_reboot: bool,
    rebooted: bool,
    clocks_synced: bool,
}

impl<'a> TargetRun<'a> {
    fn new(
        ctx: &'a NukeContext,
        job: &'a NukeJob,
        name: &'a MachineName,
        session: Arc<dyn RemoteHostSession>,
    ) -> Self {
        TargetRun {
            ctx,
            job,
            name,
            session,
            testdir: steps::testdir(&ctx.testdir_base, job.name.as_deref()),
            needs_reboot: false,
            rebooted: false,
            clocks_synced: false,
        }
    }

    async fn run(mut self) -> Result<TargetOutcome, TargetFailure> {
        self.shutdown_daemons().await;
        self.bounded(NukeStep::UnmountOsdMounts, &steps::unmount_osd_data(&self.testdir))
            .await;
        self.bounded(NukeStep::UnmountTmpfs, &steps::unmount_tmpfs()).await;
        self.handle_kernel_mounts().await;
        self.reboot_if_needed().await?;

        if self.job.synchronize_clocks || self.rebooted {
            self.clocks_synced = self.bounded(NukeStep::SyncClocks, &steps::sync_clocks()).await;
        }

        self.bounded(NukeStep::ResetSyslog, &steps::reset_syslog()).await;
        let tree = steps::clear_test_tree(&self.ctx.testdir_base);
        self.bounded(NukeStep::ClearFilesystem, &tree).await;

        tracing::info!("{} is clean", self.name);
        Ok(TargetOutcome {
            rebooted: self.rebooted,
            clocks_synced: self.clocks_synced,
            needs_reboot: self.needs_reboot,
        })
    }

    async fn try_bounded(&self, command: &Command) -> Result<ProcessOutput, RemoteError> {
        self.session
            .run_wait(command, Some(self.ctx.timeouts.command))
            .await
    }

    /// Runs `command` with the step bound. A hang flags the host for a
    /// reboot; other failures are only logged.
    async fn bounded(&mut self, step: NukeStep, command: &Command) -> bool {
        tracing::debug!("{}: {}", step, command);
        match self.try_bounded(command).await {
            Ok(_) => true,
            Err(err) => {
                self.note_failure(step, &err);
                false
            }
        }
    }

    fn note_failure(&mut self, step: NukeStep, err: &RemoteError) {
        if err.is_hang() {
            tracing::warn!("{} hung on {}: {}", step, self.name, err);
            self.needs_reboot = true;
        } else {
            tracing::warn!("{} failed on {}: {}", step, self.name, err);
        }
    }

    async fn shutdown_daemons(&mut self) {
        match self.try_bounded(&steps::fuse_unmount()).await {
            Ok(_) => {}
            Err(err) if err.is_hang() => {
                tracing::info!("fuse unmount hung on {}, aborting fuse connection", self.name);
                for command in [steps::write_abort_file(), steps::fuse_abort()] {
                    if let Err(err) = self.try_bounded(&command).await {
                        tracing::warn!("{}", err);
                    }
                }
                self.bounded(NukeStep::ShutdownDaemons, &steps::fuse_unmount())
                    .await;
            }
            Err(err) => self.note_failure(NukeStep::ShutdownDaemons, &err),
        }

        self.bounded(NukeStep::ShutdownDaemons, &steps::killall()).await;
    }

    async fn handle_kernel_mounts(&mut self) {
        let probe = steps::probe_kernel_mounts();
        let status = self
            .session
            .run(&probe)
            .exit_status(Some(self.ctx.timeouts.command))
            .await;
        match status {
            Ok(0) => {
                tracing::info!("kernel mounts present on {}, unmounting", self.name);
                self.bounded(NukeStep::HandleKernelMounts, &steps::unmount_kernel_mounts())
                    .await;
            }
            Ok(_) => {}
            Err(err) => self.note_failure(NukeStep::HandleKernelMounts, &err),
        }
    }

    async fn reboot_if_needed(&mut self) -> Result<(), TargetFailure> {
        if self.rebooted || !(self.needs_reboot || self.job.reboot_all) {
            return Ok(());
        }

        tracing::info!("rebooting {}", self.name);
        // The connection drops mid-command, so the reboot is never waited on.
        drop(self.session.run(&steps::reboot()));
        tokio::time::sleep(self.ctx.timeouts.reboot_settle).await;

        self.session
            .reconnect(self.ctx.timeouts.reboot_reconnect)
            .await
            .map_err(|err| TargetFailure::at(NukeStep::RebootIfNeeded, err))?;
        self.rebooted = true;
        self.needs_reboot = false;
        Ok(())
    }
}
