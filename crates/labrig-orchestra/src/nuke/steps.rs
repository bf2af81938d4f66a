//! Shell commands issued while cleaning a target.

use labrig_core::Command;

const MTAB: &str = "/etc/mtab";
const ABORT_FILE: &str = "/tmp/abortfile";
const SYSLOG_CONF: &str = "/etc/rsyslog.d/80-cephtest.conf";

const DAEMONS: &[&str] = &[
    "ceph-mon",
    "ceph-osd",
    "ceph-mds",
    "ceph-fuse",
    "radosgw",
    "testrados",
    "rados",
    "apache2",
];

/// The per-run test directory: `base/name` for a named run, `base` otherwise.
pub fn testdir(base: &str, run_name: Option<&str>) -> String {
    match run_name {
        Some(name) => format!("{}/{}", base.trim_end_matches('/'), name),
        None => base.to_string(),
    }
}

/// Lazily unmounts every ceph-fuse mount.
pub fn fuse_unmount() -> Command {
    Command::default()
        .raw("if")
        .args(["grep", "-q", "ceph-fuse", MTAB])
        .then()
        .raw("then")
        .args(["grep", "ceph-fuse", MTAB])
        .pipe()
        .args(["grep", "-o", " /.* fuse"])
        .pipe()
        .args(["grep", "-o", "/.* "])
        .pipe()
        .args(["xargs", "sudo", "fusermount", "-u"])
        .then()
        .raw("fi")
}

pub fn write_abort_file() -> Command {
    Command::new("echo").arg("1").redirect_to(ABORT_FILE)
}

/// Aborts the newest fuse connection, which unblocks a hung unmount.
pub fn fuse_abort() -> Command {
    Command::new("sudo")
        .args(["ls", "/sys/fs/fuse/connections/"])
        .pipe()
        .args(["tail", "-n", "1"])
        .pipe()
        .args(["sudo", "xargs", "-I", "XX", "cp", ABORT_FILE])
        .arg("/sys/fs/fuse/connections/XX/abort")
}

pub fn killall() -> Command {
    Command::new("killall")
        .arg("--quiet")
        .args(DAEMONS.iter().copied())
        .or()
        .arg("true")
}

fn unmount_matching(select: Command) -> Command {
    select
        .pipe()
        .args(["awk", "{print $2}"])
        .pipe()
        .args(["xargs", "-r", "sudo", "umount"])
        .then()
        .arg("true")
}

/// Unmounts the OSD data directories under `testdir`.
pub fn unmount_osd_data(testdir: &str) -> Command {
    unmount_matching(Command::new("grep").arg(format!("{}/data/", testdir)).arg(MTAB))
}

pub fn unmount_tmpfs() -> Command {
    unmount_matching(Command::new("egrep").arg(r"tmpfs\s+/mnt").arg(MTAB))
}

/// Exits zero when kernel ceph or rbd mounts exist.
pub fn probe_kernel_mounts() -> Command {
    Command::new("grep")
        .args(["-q", " ceph ", MTAB])
        .or()
        .args(["grep", "-q", "^/dev/rbd", MTAB])
}

pub fn unmount_kernel_mounts() -> Command {
    Command::new("grep")
        .args(["ceph", MTAB])
        .pipe()
        .args(["grep", "-o", "on /.* type"])
        .pipe()
        .args(["grep", "-o", "/.* "])
        .pipe()
        .args(["xargs", "-r", "sudo", "umount"])
        .then()
        .arg("true")
}

pub fn reboot() -> Command {
    Command::new("sudo").args(["reboot", "-f", "-n"])
}

pub fn sync_clocks() -> Command {
    Command::new("sudo")
        .args(["service", "ntp", "stop"])
        .and()
        .args(["sudo", "ntpdate-debian"])
        .and()
        .args(["sudo", "hwclock", "--systohc", "--utc"])
        .and()
        .args(["sudo", "service", "ntp", "start"])
        .or()
        .arg("true")
}

/// Drops the test rsyslog snippet and restarts rsyslog if it was present.
pub fn reset_syslog() -> Command {
    Command::default()
        .raw("if")
        .args(["test", "-e", SYSLOG_CONF])
        .then()
        .raw("then")
        .args(["sudo", "rm", "-f", "--", SYSLOG_CONF])
        .and()
        .args(["sudo", "initctl", "restart", "rsyslog"])
        .then()
        .raw("fi")
}

/// Removes the whole test tree, every run under `base` included.
pub fn clear_test_tree(base: &str) -> Command {
    Command::new("sudo").args(["rm", "-rf", "--", base])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testdir_nests_named_runs() {
        assert_eq!(testdir("/home/ubuntu/cephtest", None), "/home/ubuntu/cephtest");
        assert_eq!(
            testdir("/home/ubuntu/cephtest/", Some("run-7")),
            "/home/ubuntu/cephtest/run-7"
        );
    }

    #[test]
    fn fuse_unmount_is_guarded_by_mtab_check() {
        assert_eq!(
            fuse_unmount().render(),
            "if grep -q ceph-fuse /etc/mtab ; then grep ceph-fuse /etc/mtab \
             | grep -o ' /.* fuse' | grep -o '/.* ' | xargs sudo fusermount -u ; fi"
        );
    }

    #[test]
    fn unmount_commands_never_fail_on_empty_input() {
        assert_eq!(
            unmount_osd_data("/home/ubuntu/cephtest").render(),
            "grep /home/ubuntu/cephtest/data/ /etc/mtab | awk '{print $2}' \
             | xargs -r sudo umount ; true"
        );
        assert_eq!(
            unmount_tmpfs().render(),
            r"egrep 'tmpfs\s+/mnt' /etc/mtab | awk '{print $2}' | xargs -r sudo umount ; true"
        );
        assert!(unmount_kernel_mounts().render().ends_with("xargs -r sudo umount ; true"));
    }

    #[test]
    fn killall_tolerates_missing_daemons() {
        let line = killall().render();
        assert!(line.starts_with("killall --quiet ceph-mon ceph-osd"));
        assert!(line.ends_with("apache2 || true"));
    }

    #[test]
    fn abort_file_redirect_and_syslog_reset() {
        assert_eq!(write_abort_file().render(), "echo 1 > /tmp/abortfile");
        assert_eq!(
            reset_syslog().render(),
            "if test -e /etc/rsyslog.d/80-cephtest.conf ; then sudo rm -f -- \
             /etc/rsyslog.d/80-cephtest.conf && sudo initctl restart rsyslog ; fi"
        );
    }
}
