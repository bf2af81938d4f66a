//! Multi-host orchestration for the test lab.
//!
//! - [`parallel`]: bounded fan-out/fan-in task executor
//! - [`contextutil`]: ordered setup/teardown scopes with LIFO unwind
//! - [`remote`], [`ssh`]: remote command sessions and the ssh backend
//! - [`console`]: out-of-band power control (IPMI)
//! - [`provision`]: VM creation and destruction (downburst)
//! - [`lock_client`]: HTTP and in-process clients of the lock service
//! - [`nuke`]: concurrent teardown of a set of targets

pub mod console;
pub mod contextutil;
pub mod lock_client;
pub mod nuke;
pub mod parallel;
pub mod provision;
pub mod remote;
pub mod ssh;

pub use console::{Console, ConsoleError, ConsoleFactory, IpmiConsoleFactory, IpmiCredentials};
pub use contextutil::{NestedScopes, OperatorHook, Release};
pub use lock_client::{HttpLockClient, LockClient, LockClientError, RegistryLockClient};
pub use nuke::{
    nuke, NukeContext, NukeJob, NukeReport, NukeStep, NukeTimeouts, TargetFailure, TargetOutcome,
};
pub use parallel::{ParallelError, ParallelExecutor, TaskOutcome, TaskResult};
pub use provision::{Downburst, DownburstOptions, MachineSpec, ProvisionError, ProvisioningBackend};
pub use remote::{ProcessOutput, RemoteError, RemoteHostSession, RemoteProcess, SessionConnector};
pub use ssh::{SshConnector, SshSession};
