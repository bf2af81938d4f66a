//! Reclaiming test machines after a run.
//!
//! [`nuke`] cleans every target of a [`NukeJob`] concurrently: each target's
//! whole teardown is one unit on a [`ParallelExecutor`], so a wedged or
//! unreachable host never holds up the others. Targets that come out clean
//! are released back to the lock service when the job asks for it; the rest
//! stay locked and are listed in the [`NukeReport`].

pub mod steps;
mod target;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;
use uuid::Uuid;

use labrig_core::{MachineName, Owner};

use crate::console::ConsoleFactory;
use crate::contextutil::OperatorHook;
use crate::lock_client::LockClient;
use crate::parallel::{ParallelExecutor, TaskOutcome, DEFAULT_MAX_PARALLELISM};
use crate::remote::SessionConnector;

pub use target::{NukeStep, TargetFailure, TargetOutcome};

pub const DEFAULT_TESTDIR_BASE: &str = "/home/ubuntu/cephtest";

/// Bounds used while cleaning a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NukeTimeouts {
    /// Every remote step.
    pub command: Duration,
    /// First console status check; `None` checks once without polling.
    pub console_check: Option<Duration>,
    /// Waiting for a host to report power on after powering it on.
    pub console_ready: Duration,
    /// Waiting for a rebooted host to accept connections again.
    pub reboot_reconnect: Duration,
    /// Pause between issuing the reboot and the first reconnect attempt.
    pub reboot_settle: Duration,
}

impl Default for NukeTimeouts {
    fn default() -> Self {
        NukeTimeouts {
            command: Duration::from_secs(20),
            console_check: None,
            console_ready: Duration::from_secs(100),
            reboot_reconnect: Duration::from_secs(480),
            reboot_settle: Duration::from_secs(5),
        }
    }
}

/// One nuke run.
#[derive(Debug, Clone)]
pub struct NukeJob {
    /// Tags the tracing spans of this run.
    pub run_id: Uuid,
    /// Name of the test run; its test directory is nested under the base.
    pub name: Option<String>,
    pub targets: BTreeSet<MachineName>,
    pub owner: Owner,
    pub should_unlock: bool,
    pub synchronize_clocks: bool,
    pub reboot_all: bool,
    pub check_locks: bool,
}

impl NukeJob {
    pub fn new(targets: impl IntoIterator<Item = MachineName>, owner: Owner) -> Self {
        NukeJob {
            run_id: Uuid::new_v4(),
            name: None,
            targets: targets.into_iter().collect(),
            owner,
            should_unlock: false,
            synchronize_clocks: false,
            reboot_all: false,
            check_locks: true,
        }
    }
}

/// Everything a run talks to.
#[derive(Clone)]
pub struct NukeContext {
    pub connector: Arc<dyn SessionConnector>,
    pub consoles: Option<Arc<dyn ConsoleFactory>>,
    pub locks: Arc<dyn LockClient>,
    pub testdir_base: String,
    pub timeouts: NukeTimeouts,
    pub operator_hook: Option<Arc<dyn OperatorHook>>,
    pub max_parallelism: usize,
}

impl NukeContext {
    pub fn new(connector: Arc<dyn SessionConnector>, locks: Arc<dyn LockClient>) -> Self {
        NukeContext {
            connector,
            consoles: None,
            locks,
            testdir_base: DEFAULT_TESTDIR_BASE.to_string(),
            timeouts: NukeTimeouts::default(),
            operator_hook: None,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
        }
    }

    pub fn with_consoles(mut self, consoles: Arc<dyn ConsoleFactory>) -> Self {
        self.consoles = Some(consoles);
        self
    }

    pub fn with_testdir_base(mut self, base: impl Into<String>) -> Self {
        self.testdir_base = base.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: NukeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_operator_hook(mut self, hook: Arc<dyn OperatorHook>) -> Self {
        self.operator_hook = Some(hook);
        self
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }
}

/// The result of a run.
#[derive(Debug, Default)]
pub struct NukeReport {
    pub nuked: BTreeSet<MachineName>,
    pub failed: BTreeMap<MachineName, TargetFailure>,
    /// Nuked targets whose lock could not be released.
    pub unlock_failures: BTreeMap<MachineName, String>,
    /// Per-target details for every nuked target.
    pub outcomes: BTreeMap<MachineName, TargetOutcome>,
}

impl NukeReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Cleaned {
    outcome: TargetOutcome,
    unlock_failure: Option<String>,
}

/// Cleans every target of `job` and waits for all of them.
pub async fn nuke(ctx: &NukeContext, job: &NukeJob) -> NukeReport {
    tracing::info!(
        run = %job.run_id,
        "nuking {} target(s) as {}",
        job.targets.len(),
        job.owner
    );

    let job = Arc::new(job.clone());
    let mut executor: ParallelExecutor<Cleaned, TargetFailure> =
        ParallelExecutor::with_parallelism(ctx.max_parallelism);
    let mut labels: BTreeMap<String, MachineName> = BTreeMap::new();

    for name in &job.targets {
        let span = tracing::info_span!("nuke", run = %job.run_id, target = %name);
        let ctx = ctx.clone();
        let job = Arc::clone(&job);
        let machine = name.clone();
        labels.insert(name.to_string(), name.clone());

        executor.spawn(
            name.to_string(),
            async move {
                let outcome = target::nuke_target(&ctx, &job, &machine).await?;
                let unlock_failure = if job.should_unlock {
                    unlock(&ctx, &job, &machine).await
                } else {
                    None
                };
                Ok(Cleaned {
                    outcome,
                    unlock_failure,
                })
            }
            .instrument(span),
        );
    }

    let mut report = NukeReport::default();
    while let Some(result) = executor.next().await {
        let Some(name) = labels.remove(&result.target) else {
            tracing::error!("result for unknown target {}", result.target);
            continue;
        };
        match result.outcome {
            TaskOutcome::Success(cleaned) => {
                if let Some(reason) = cleaned.unlock_failure {
                    report.unlock_failures.insert(name.clone(), reason);
                }
                report.outcomes.insert(name.clone(), cleaned.outcome);
                report.nuked.insert(name);
            }
            TaskOutcome::Failed(failure) => {
                tracing::error!("could not nuke {}: {}", name, failure);
                report.failed.insert(name, failure);
            }
            TaskOutcome::Panicked(message) => {
                tracing::error!("nuking {} panicked: {}", name, message);
                report.failed.insert(
                    name,
                    TargetFailure {
                        step: None,
                        reason: format!("panicked: {}", message),
                    },
                );
            }
            TaskOutcome::TimedOut(bound) => {
                report.failed.insert(
                    name,
                    TargetFailure {
                        step: None,
                        reason: format!("timed out after {:?}", bound),
                    },
                );
            }
        }
    }

    if report.is_success() {
        tracing::info!(run = %job.run_id, "all {} target(s) nuked", report.nuked.len());
    } else {
        tracing::error!(
            run = %job.run_id,
            "{} target(s) could not be nuked",
            report.failed.len()
        );
    }
    report
}

async fn unlock(ctx: &NukeContext, job: &NukeJob, name: &MachineName) -> Option<String> {
    match ctx.locks.release(name, &job.owner, false).await {
        Ok(_) => {
            tracing::info!("unlocked {}", name);
            None
        }
        Err(err) => {
            tracing::error!("failed to unlock {}: {}", name, err);
            Some(err.to_string())
        }
    }
}
