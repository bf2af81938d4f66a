//! Test-lab command line.
//!
//! Provides the `labrig` binary: `nuke` reclaims machines after a test run,
//! and `lock`, `unlock`, `list` and `status` talk to the lock server.
//!
//! Exit codes: 0 on success, 1 when any machine could not be handled,
//! 2 on configuration or usage errors.

mod config;
mod operator;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use labrig_core::{Command, MachineFilter, MachineName, MachineRecord, Owner};
use labrig_orchestra::provision::{create_if_vm, destroy_if_vm};
use labrig_orchestra::{
    nuke, Downburst, HttpLockClient, IpmiConsoleFactory, LockClient, NukeContext, NukeJob,
    NukeReport, SshConnector,
};

use crate::config::{load_targets, Config, ConfigError, JobArchive};
use crate::operator::StdinOperator;

const EXIT_FAILED: i32 = 1;
const EXIT_USAGE: i32 = 2;

/// Test-lab machine locking and teardown.
#[derive(Parser)]
#[command(name = "labrig", about = "Test-lab machine locking and teardown")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.labrig.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean up machines after a test run.
    Nuke(NukeArgs),

    /// Lock machines by name, or any N free machines.
    Lock {
        /// Machines to lock.
        machines: Vec<String>,

        /// Lock this many free machines instead of naming them.
        #[arg(long, conflicts_with = "machines")]
        count: Option<usize>,

        /// With --count, only pick VMs (true) or physical hosts (false).
        #[arg(long)]
        vm: Option<bool>,

        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        desc: Option<String>,
    },

    /// Release machines, destroying VMs first.
    Unlock {
        #[arg(required = true)]
        machines: Vec<String>,

        #[arg(long)]
        owner: Option<String>,

        /// Release even when someone else holds the lock.
        #[arg(long)]
        force: bool,
    },

    /// List machines matching every given filter.
    List {
        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        locked: Option<bool>,

        #[arg(long)]
        up: Option<bool>,

        #[arg(long)]
        vm: Option<bool>,
    },

    /// Show one machine.
    Status { machine: String },
}

#[derive(Args)]
struct NukeArgs {
    /// TOML files with a [targets] table.
    #[arg(short, long = "targets", value_name = "FILE")]
    targets_files: Vec<PathBuf>,

    /// Individual machines to nuke.
    #[arg(long = "target", value_name = "NAME")]
    target: Vec<String>,

    /// Lock owner (default: user@host, or the archive's owner).
    #[arg(long)]
    owner: Option<String>,

    /// Release the lock of every machine that was cleaned.
    #[arg(short, long)]
    unlock: bool,

    /// Reboot every machine, not only those that hung.
    #[arg(short, long)]
    reboot_all: bool,

    /// Resynchronize clocks on every machine.
    #[arg(short, long)]
    synch_clocks: bool,

    /// Do not verify that the owner holds each lock.
    #[arg(long)]
    no_check_locks: bool,

    /// Job archive to take owner, pid and targets from.
    #[arg(short, long, value_name = "DIR")]
    archive: Option<PathBuf>,

    /// Kill this job process before cleaning up.
    #[arg(short, long)]
    pid: Option<i32>,

    /// Name of the run whose test directory is removed.
    #[arg(short, long)]
    name: Option<String>,
}

/// The TOML document printed for targets that could not be cleaned.
#[derive(Serialize)]
struct FailedTargets {
    targets: BTreeMap<String, String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(EXIT_USAGE);
        }
    };

    let exit_code = match cli.command {
        Commands::Nuke(args) => run_nuke(&config, args).await,
        Commands::Lock {
            machines,
            count,
            vm,
            owner,
            desc,
        } => run_lock(&config, machines, count, vm, owner, desc).await,
        Commands::Unlock {
            machines,
            owner,
            force,
        } => run_unlock(&config, machines, owner, force).await,
        Commands::List {
            owner,
            locked,
            up,
            vm,
        } => run_list(&config, owner, locked, up, vm).await,
        Commands::Status { machine } => run_status(&config, &machine).await,
    };
    process::exit(exit_code);
}

/// `user@host` of whoever runs the command.
fn default_owner() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "nobody".to_string());
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

fn parse_owner(owner: Option<String>) -> Result<Owner, i32> {
    Owner::new(owner.unwrap_or_else(default_owner)).map_err(|e| {
        eprintln!("Error: {}", e);
        EXIT_USAGE
    })
}

fn parse_names(names: &[String]) -> Result<Vec<MachineName>, i32> {
    names
        .iter()
        .map(|n| {
            MachineName::new(n.as_str()).map_err(|e| {
                eprintln!("Error: {}", e);
                EXIT_USAGE
            })
        })
        .collect()
}

fn lock_client(config: &Config) -> Result<HttpLockClient, i32> {
    config
        .lock_server()
        .map(HttpLockClient::new)
        .map_err(|e| {
            eprintln!("Error: {}", e);
            EXIT_USAGE
        })
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: failed to serialize output: {}", e),
    }
}

/// Execute the nuke subcommand.
async fn run_nuke(config: &Config, args: NukeArgs) -> i32 {
    match build_nuke(config, args).await {
        Ok((ctx, job)) => {
            let report = nuke(&ctx, &job).await;
            report_nuke(&report)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            EXIT_USAGE
        }
    }
}

async fn build_nuke(config: &Config, args: NukeArgs) -> Result<(NukeContext, NukeJob), ConfigError> {
    let mut targets: BTreeMap<String, String> = BTreeMap::new();
    let mut owner = args.owner;
    let mut pid = args.pid;

    if let Some(dir) = &args.archive {
        let archive = JobArchive::load(dir)?;
        owner = owner.or(Some(archive.owner));
        pid = pid.or(archive.pid);
        targets.extend(archive.targets);
    }
    for path in &args.targets_files {
        targets.extend(load_targets(path)?);
    }
    for name in args.target {
        targets.entry(name).or_default();
    }
    if targets.is_empty() {
        return Err(ConfigError::Invalid {
            what: "targets",
            value: String::new(),
            reason: "no targets given".to_string(),
        });
    }

    let owner_text = owner.unwrap_or_else(default_owner);
    let owner = Owner::new(owner_text.as_str()).map_err(|e| ConfigError::Invalid {
        what: "owner",
        value: owner_text.clone(),
        reason: e.to_string(),
    })?;
    let names = targets
        .keys()
        .map(|name| {
            MachineName::new(name.as_str()).map_err(|e| ConfigError::Invalid {
                what: "target",
                value: name.clone(),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let locks = Arc::new(HttpLockClient::new(config.lock_server()?));

    if let Some(pid) = pid {
        kill_job(pid, args.archive.as_deref()).await;
    }

    let mut ctx = NukeContext::new(Arc::new(SshConnector::default()), locks)
        .with_timeouts(config.timeouts.resolve());
    if let Some(base) = &config.testdir_base {
        ctx = ctx.with_testdir_base(base.clone());
    }
    if let Some(credentials) = config.ipmi() {
        ctx = ctx.with_consoles(Arc::new(IpmiConsoleFactory::new(credentials)));
    }
    if config.interactive_on_error {
        ctx = ctx.with_operator_hook(Arc::new(StdinOperator));
    }
    if let Some(max) = config.max_parallelism {
        ctx = ctx.with_max_parallelism(max);
    }

    let mut job = NukeJob::new(names, owner);
    job.name = args.name;
    job.should_unlock = args.unlock;
    job.synchronize_clocks = args.synch_clocks;
    job.reboot_all = args.reboot_all;
    job.check_locks = !args.no_check_locks;
    Ok((ctx, job))
}

/// How to stop the job process of a run being reclaimed.
///
/// A pid read from a job archive may be stale, so the process is only
/// signalled if its command line still names the archive. An explicit pid
/// without an archive is killed outright.
fn kill_command(pid: i32, archive: Option<&Path>) -> Command {
    let pid = pid.to_string();
    match archive {
        Some(archive) => Command::new("grep")
            .args(["-qF", "--"])
            .arg(archive.to_string_lossy())
            .arg(format!("/proc/{}/cmdline", pid))
            .and()
            .args(["sudo", "kill"])
            .arg(pid),
        None => Command::new("kill").arg("-KILL").arg(pid),
    }
}

async fn kill_job(pid: i32, archive: Option<&Path>) {
    let command = kill_command(pid, archive);
    tracing::info!("killing job process {}: {}", pid, command);
    let result = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command.render())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!("killing {} exited with {}", pid, status),
        Err(e) => tracing::warn!("could not run kill for {}: {}", pid, e),
    }
}

fn report_nuke(report: &NukeReport) -> i32 {
    for (name, reason) in &report.unlock_failures {
        tracing::warn!("{} was cleaned but is still locked: {}", name, reason);
    }
    if report.is_success() {
        tracing::info!("{} machine(s) nuked", report.nuked.len());
        return 0;
    }

    let failed = FailedTargets {
        targets: report
            .failed
            .iter()
            .map(|(name, failure)| (name.to_string(), failure.to_string()))
            .collect(),
    };
    eprintln!("Could not nuke the following targets:");
    match toml::to_string(&failed) {
        Ok(text) => print!("{}", text),
        Err(e) => eprintln!("Error: failed to render failed targets: {}", e),
    }
    EXIT_FAILED
}

/// Execute the lock subcommand.
async fn run_lock(
    config: &Config,
    machines: Vec<String>,
    count: Option<usize>,
    vm: Option<bool>,
    owner: Option<String>,
    desc: Option<String>,
) -> i32 {
    let owner = match parse_owner(owner) {
        Ok(owner) => owner,
        Err(code) => return code,
    };
    let client = match lock_client(config) {
        Ok(client) => client,
        Err(code) => return code,
    };

    let locked: Vec<MachineRecord> = match count {
        Some(count) => match client.acquire_many(count, &owner, desc.as_deref(), vm).await {
            Ok(records) => records,
            Err(e) => {
                eprintln!("Error: {}", e);
                return EXIT_FAILED;
            }
        },
        None => {
            let names = match parse_names(&machines) {
                Ok(names) if !names.is_empty() => names,
                Ok(_) => {
                    eprintln!("Error: name machines to lock or pass --count");
                    return EXIT_USAGE;
                }
                Err(code) => return code,
            };
            let mut records = Vec::with_capacity(names.len());
            let mut failed = false;
            for name in &names {
                match client.acquire(name, &owner, desc.as_deref()).await {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        failed = true;
                    }
                }
            }
            if failed {
                print_json(&records);
                return EXIT_FAILED;
            }
            records
        }
    };

    let mut exit_code = 0;
    let options = config.downburst.clone().unwrap_or_default();
    let backend = Downburst::new(&options);
    for record in locked.iter().filter(|r| r.is_vm) {
        match create_if_vm(&client, &backend, &record.name, &options).await {
            Ok(true) => tracing::info!("created {}", record.name),
            Ok(false) => {
                eprintln!("Error: could not create {}", record.name);
                exit_code = EXIT_FAILED;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_code = EXIT_FAILED;
            }
        }
    }

    print_json(&locked);
    exit_code
}

/// Execute the unlock subcommand.
async fn run_unlock(
    config: &Config,
    machines: Vec<String>,
    owner: Option<String>,
    force: bool,
) -> i32 {
    let owner = match parse_owner(owner) {
        Ok(owner) => owner,
        Err(code) => return code,
    };
    let names = match parse_names(&machines) {
        Ok(names) => names,
        Err(code) => return code,
    };
    let client = match lock_client(config) {
        Ok(client) => client,
        Err(code) => return code,
    };

    let backend = Downburst::new(&config.downburst.clone().unwrap_or_default());
    let mut exit_code = 0;
    for name in &names {
        match destroy_if_vm(&client, &backend, name).await {
            Ok(true) => {}
            Ok(false) => {
                eprintln!("Error: could not destroy {}, leaving it locked", name);
                exit_code = EXIT_FAILED;
                continue;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_code = EXIT_FAILED;
                continue;
            }
        }
        match client.release(name, &owner, force).await {
            Ok(_) => tracing::info!("unlocked {}", name),
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_code = EXIT_FAILED;
            }
        }
    }
    exit_code
}

/// Execute the list subcommand.
async fn run_list(
    config: &Config,
    owner: Option<String>,
    locked: Option<bool>,
    up: Option<bool>,
    vm: Option<bool>,
) -> i32 {
    let owner = match owner.map(Owner::new).transpose() {
        Ok(owner) => owner,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_USAGE;
        }
    };
    let client = match lock_client(config) {
        Ok(client) => client,
        Err(code) => return code,
    };

    let filter = MachineFilter {
        owner,
        locked,
        up,
        is_vm: vm,
    };
    match client.list(&filter).await {
        Ok(records) => {
            print_json(&records);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            EXIT_FAILED
        }
    }
}

/// Execute the status subcommand.
async fn run_status(config: &Config, machine: &str) -> i32 {
    let name = match MachineName::new(machine) {
        Ok(name) => name,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_USAGE;
        }
    };
    let client = match lock_client(config) {
        Ok(client) => client,
        Err(code) => return code,
    };

    match client.status(&name).await {
        Ok(record) => {
            print_json(&record);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            EXIT_FAILED
        }
    }
}
