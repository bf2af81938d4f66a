//! End-to-end nuke runs against scripted hosts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use labrig_core::{Command, MachineAttrs, MachineName, Owner};
use labrig_orchestra::{
    nuke, Console, ConsoleError, ConsoleFactory, NukeContext, NukeJob, NukeStep, NukeTimeouts,
    ProcessOutput, RegistryLockClient, RemoteError, RemoteHostSession, RemoteProcess,
    SessionConnector,
};
use labrig_storage::{InMemoryStore, LockRegistry};

const HOST_A: &str = "ubuntu@host-a.front.example.com";
const HOST_B: &str = "ubuntu@host-b.front.example.com";

/// Scripted hosts that record every command line they are sent.
#[derive(Default)]
struct FakeLab {
    unreachable: HashSet<String>,
    /// Unreachable until powered on through the console.
    powered_off: HashSet<String>,
    /// Never come back after a reboot.
    stay_down_after_reboot: HashSet<String>,
    powered_on: Mutex<HashSet<String>>,
    connect_attempts: Mutex<Vec<String>>,
    console_log: Mutex<Vec<(String, String)>>,
    /// (host, substring): matching commands never finish.
    hangs: Vec<(String, String)>,
    log: Mutex<Vec<(String, String)>>,
}

impl FakeLab {
    fn commands_for(&self, host: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, line)| line.clone())
            .collect()
    }

    fn ran(&self, host: &str, needle: &str) -> bool {
        self.commands_for(host).iter().any(|line| line.contains(needle))
    }

    fn connect_attempts(&self, host: &str) -> usize {
        self.connect_attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.as_str() == host)
            .count()
    }

    fn console_calls(&self, host: &str) -> Vec<String> {
        self.console_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, call)| call.clone())
            .collect()
    }

    fn is_down(&self, host: &str) -> bool {
        self.unreachable.contains(host)
            || (self.powered_off.contains(host)
                && !self.powered_on.lock().unwrap().contains(host))
    }
}

struct FakeConnector(Arc<FakeLab>);

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, name: &MachineName) -> Result<Arc<dyn RemoteHostSession>, RemoteError> {
        self.0
            .connect_attempts
            .lock()
            .unwrap()
            .push(name.to_string());
        if self.0.is_down(name.as_str()) {
            return Err(RemoteError::ConnectionLost {
                host: name.clone(),
                reason: "no route to host".into(),
            });
        }
        Ok(Arc::new(FakeSession {
            name: name.clone(),
            lab: Arc::clone(&self.0),
        }))
    }
}

struct FakeSession {
    name: MachineName,
    lab: Arc<FakeLab>,
}

#[async_trait]
impl RemoteHostSession for FakeSession {
    fn name(&self) -> &MachineName {
        &self.name
    }

    fn run(&self, command: &Command) -> RemoteProcess {
        let line = command.render();
        self.lab
            .log
            .lock()
            .unwrap()
            .push((self.name.to_string(), line.clone()));

        let hangs = self
            .lab
            .hangs
            .iter()
            .any(|(host, needle)| host == self.name.as_str() && line.contains(needle));
        if hangs {
            return RemoteProcess::spawn(self.name.clone(), command, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ProcessOutput::default())
            });
        }

        // No kernel mounts anywhere.
        let status = if line.contains("grep -q ' ceph '") { 1 } else { 0 };
        RemoteProcess::completed(
            self.name.clone(),
            command,
            Ok(ProcessOutput {
                status,
                ..Default::default()
            }),
        )
    }

    async fn reconnect(&self, _timeout: Duration) -> Result<(), RemoteError> {
        self.lab
            .log
            .lock()
            .unwrap()
            .push((self.name.to_string(), "<reconnect>".into()));
        if self.lab.stay_down_after_reboot.contains(self.name.as_str()) {
            return Err(RemoteError::ConnectionLost {
                host: self.name.clone(),
                reason: "did not come back".into(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// A console that always reports power and records what it was asked.
struct FakeConsole {
    host: String,
    lab: Arc<FakeLab>,
}

impl FakeConsole {
    fn record(&self, call: &str) {
        self.lab
            .console_log
            .lock()
            .unwrap()
            .push((self.host.clone(), call.to_string()));
    }
}

#[async_trait]
impl Console for FakeConsole {
    fn host(&self) -> &str {
        &self.host
    }

    async fn check_status(&self, _timeout: Option<Duration>) -> bool {
        self.record("check");
        true
    }

    async fn power_on(&self) -> Result<(), ConsoleError> {
        self.record("on");
        self.lab.powered_on.lock().unwrap().insert(self.host.clone());
        Ok(())
    }

    async fn power_cycle(&self, _wait: Duration) -> Result<(), ConsoleError> {
        self.record("cycle");
        Ok(())
    }
}

struct FakeConsoles(Arc<FakeLab>);

impl ConsoleFactory for FakeConsoles {
    fn console_for(&self, name: &MachineName) -> Arc<dyn Console> {
        Arc::new(FakeConsole {
            host: name.to_string(),
            lab: Arc::clone(&self.0),
        })
    }
}

fn name(s: &str) -> MachineName {
    MachineName::new(s).unwrap()
}

fn owner(s: &str) -> Owner {
    Owner::new(s).unwrap()
}

fn fast_timeouts() -> NukeTimeouts {
    NukeTimeouts {
        command: Duration::from_millis(100),
        console_check: None,
        console_ready: Duration::from_millis(100),
        reboot_reconnect: Duration::from_secs(1),
        reboot_settle: Duration::from_millis(1),
    }
}

/// Registers both hosts and locks them for `holder`.
fn locked_registry(holder: &str) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for host in [HOST_A, HOST_B] {
        store
            .register(&name(host), &MachineAttrs::physical())
            .unwrap();
        store
            .acquire(&name(host), &owner(holder), Some("test run"))
            .unwrap();
    }
    store
}

fn context(lab: &Arc<FakeLab>, store: &Arc<InMemoryStore>) -> NukeContext {
    NukeContext::new(
        Arc::new(FakeConnector(Arc::clone(lab))),
        Arc::new(RegistryLockClient::new(store.clone())),
    )
    .with_timeouts(fast_timeouts())
}

#[tokio::test]
async fn only_the_hung_host_is_rebooted() {
    let lab = Arc::new(FakeLab {
        hangs: vec![(HOST_A.to_string(), "tmpfs".to_string())],
        ..Default::default()
    });
    let store = locked_registry("alice@laptop");
    let ctx = context(&lab, &store);
    let job = NukeJob::new([name(HOST_A), name(HOST_B)], owner("alice@laptop"));

    let report = nuke(&ctx, &job).await;

    assert!(report.is_success(), "failed: {:?}", report.failed);
    assert_eq!(report.nuked.len(), 2);

    let a = &report.outcomes[&name(HOST_A)];
    let b = &report.outcomes[&name(HOST_B)];
    assert!(a.rebooted);
    assert!(a.clocks_synced);
    assert!(!a.needs_reboot);
    assert!(!b.rebooted);
    assert!(!b.clocks_synced);

    assert!(lab.ran(HOST_A, "sudo reboot -f -n"));
    assert!(lab.ran(HOST_A, "<reconnect>"));
    assert!(!lab.ran(HOST_B, "sudo reboot"));
    assert!(!lab.ran(HOST_B, "ntpdate-debian"));

    // The remaining steps still ran on both hosts after the hang.
    for host in [HOST_A, HOST_B] {
        assert!(lab.ran(host, "killall --quiet"));
        assert!(lab.ran(host, "80-cephtest.conf"));
        assert!(lab.ran(host, "sudo rm -rf -- /home/ubuntu/cephtest"));
    }

    // Nothing was unlocked: the job did not ask for it.
    assert!(store.get(&name(HOST_A)).unwrap().locked);
    assert!(store.get(&name(HOST_B)).unwrap().locked);
}

#[tokio::test]
async fn unreachable_host_stays_locked_while_the_other_is_released() {
    let lab = Arc::new(FakeLab {
        unreachable: [HOST_A.to_string()].into_iter().collect(),
        ..Default::default()
    });
    let store = locked_registry("alice@laptop");
    let ctx = context(&lab, &store);
    let mut job = NukeJob::new([name(HOST_A), name(HOST_B)], owner("alice@laptop"));
    job.should_unlock = true;

    let report = nuke(&ctx, &job).await;

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    let failure = &report.failed[&name(HOST_A)];
    assert_eq!(failure.step, Some(NukeStep::Connect));
    assert!(report.nuked.contains(&name(HOST_B)));
    assert!(report.unlock_failures.is_empty());

    let a = store.get(&name(HOST_A)).unwrap();
    assert!(a.locked);
    assert_eq!(a.locked_by, Some(owner("alice@laptop")));
    let b = store.get(&name(HOST_B)).unwrap();
    assert!(!b.locked);
    assert_eq!(b.locked_by, None);

    assert!(lab.commands_for(HOST_A).is_empty());
}

#[tokio::test]
async fn targets_held_by_someone_else_are_not_touched() {
    let lab = Arc::new(FakeLab::default());
    let store = locked_registry("bob@desk");
    let ctx = context(&lab, &store);
    let mut job = NukeJob::new([name(HOST_A)], owner("alice@laptop"));
    job.should_unlock = true;

    let report = nuke(&ctx, &job).await;

    let failure = &report.failed[&name(HOST_A)];
    assert_eq!(failure.step, Some(NukeStep::CheckLock));
    assert!(failure.reason.contains("bob@desk"));
    assert!(lab.commands_for(HOST_A).is_empty());
    assert_eq!(
        store.get(&name(HOST_A)).unwrap().locked_by,
        Some(owner("bob@desk"))
    );
}

#[tokio::test]
async fn lock_check_can_be_skipped() {
    let lab = Arc::new(FakeLab::default());
    let store = locked_registry("bob@desk");
    let ctx = context(&lab, &store);
    let mut job = NukeJob::new([name(HOST_A)], owner("alice@laptop"));
    job.check_locks = false;

    let report = nuke(&ctx, &job).await;
    assert!(report.is_success(), "failed: {:?}", report.failed);
    assert!(lab.ran(HOST_A, "killall"));
}

#[tokio::test]
async fn reboot_all_reboots_every_host_once_and_syncs_clocks() {
    let lab = Arc::new(FakeLab::default());
    let store = locked_registry("alice@laptop");
    let ctx = context(&lab, &store);
    let mut job = NukeJob::new([name(HOST_A), name(HOST_B)], owner("alice@laptop"));
    job.reboot_all = true;
    job.name = Some("run-42".into());

    let report = nuke(&ctx, &job).await;

    assert!(report.is_success(), "failed: {:?}", report.failed);
    for host in [HOST_A, HOST_B] {
        assert!(report.outcomes[&name(host)].rebooted);
        let reboots = lab
            .commands_for(host)
            .iter()
            .filter(|line| line.contains("sudo reboot"))
            .count();
        assert_eq!(reboots, 1);
        assert!(lab.ran(host, "sudo service ntp stop && sudo ntpdate-debian"));
        // Mounts are scoped to the run; the whole test tree is removed.
        assert!(lab.ran(host, "grep /home/ubuntu/cephtest/run-42/data/ /etc/mtab"));
        assert!(lab.ran(host, "sudo rm -rf -- /home/ubuntu/cephtest"));
        assert!(!lab.ran(host, "rm -rf -- /home/ubuntu/cephtest/run-42"));
    }
}

#[tokio::test]
async fn hung_fuse_unmount_is_aborted_and_retried() {
    let lab = Arc::new(FakeLab {
        hangs: vec![(HOST_B.to_string(), "fusermount".to_string())],
        ..Default::default()
    });
    let store = locked_registry("alice@laptop");
    let ctx = context(&lab, &store);
    let job = NukeJob::new([name(HOST_B)], owner("alice@laptop"));

    let report = nuke(&ctx, &job).await;

    assert!(report.is_success(), "failed: {:?}", report.failed);
    let commands = lab.commands_for(HOST_B);
    let unmounts = commands.iter().filter(|l| l.contains("fusermount")).count();
    assert_eq!(unmounts, 2);
    assert!(lab.ran(HOST_B, "echo 1 > /tmp/abortfile"));
    assert!(lab.ran(HOST_B, "/sys/fs/fuse/connections/XX/abort"));
    // The retry hung too, so the host was rebooted.
    assert!(report.outcomes[&name(HOST_B)].rebooted);
}

#[tokio::test]
async fn unreachable_host_is_powered_on_through_its_console() {
    let lab = Arc::new(FakeLab {
        powered_off: [HOST_A.to_string()].into_iter().collect(),
        ..Default::default()
    });
    let store = locked_registry("alice@laptop");
    let ctx = context(&lab, &store).with_consoles(Arc::new(FakeConsoles(Arc::clone(&lab))));
    let mut job = NukeJob::new([name(HOST_A)], owner("alice@laptop"));
    job.should_unlock = true;

    let report = nuke(&ctx, &job).await;

    assert!(report.is_success(), "failed: {:?}", report.failed);
    assert_eq!(lab.connect_attempts(HOST_A), 2);
    assert_eq!(lab.console_calls(HOST_A), ["check", "on", "check"]);
    assert!(lab.ran(HOST_A, "killall --quiet"));
    assert!(!store.get(&name(HOST_A)).unwrap().locked);
}

#[tokio::test]
async fn unreachable_host_without_console_is_tried_once() {
    let lab = Arc::new(FakeLab {
        powered_off: [HOST_A.to_string()].into_iter().collect(),
        ..Default::default()
    });
    let store = locked_registry("alice@laptop");
    let ctx = context(&lab, &store);
    let job = NukeJob::new([name(HOST_A)], owner("alice@laptop"));

    let report = nuke(&ctx, &job).await;

    assert_eq!(report.failed[&name(HOST_A)].step, Some(NukeStep::Connect));
    assert_eq!(lab.connect_attempts(HOST_A), 1);
}

#[tokio::test]
async fn host_lost_after_reboot_fails_and_stays_locked() {
    let lab = Arc::new(FakeLab {
        stay_down_after_reboot: [HOST_A.to_string()].into_iter().collect(),
        ..Default::default()
    });
    let store = locked_registry("alice@laptop");
    let ctx = context(&lab, &store);
    let mut job = NukeJob::new([name(HOST_A), name(HOST_B)], owner("alice@laptop"));
    job.reboot_all = true;
    job.should_unlock = true;

    let report = nuke(&ctx, &job).await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(
        report.failed[&name(HOST_A)].step,
        Some(NukeStep::RebootIfNeeded)
    );
    assert!(report.nuked.contains(&name(HOST_B)));

    // Nothing after the reboot ran on the lost host.
    assert!(!lab.ran(HOST_A, "ntpdate-debian"));
    assert!(!lab.ran(HOST_A, "rm -rf"));

    let a = store.get(&name(HOST_A)).unwrap();
    assert!(a.locked);
    assert_eq!(a.locked_by, Some(owner("alice@laptop")));
    assert!(!store.get(&name(HOST_B)).unwrap().locked);
}
