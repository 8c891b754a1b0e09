//! Soft memory ceiling for backends without a native memory cgroup.
//!
//! Resident memory is sampled every `interval`; the first sample above the
//! ceiling kills the process. A child that leads its own process group is
//! measured together with everything in that group, so programs started
//! through a shell or forked by the submission count too. Sampling is racy by nature: a process can
//! overshoot by whatever it allocates within one interval, and a spike that
//! starts and ends between two samples goes unseen.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct MemoryMonitor {
    limit_kb: u64,
    interval: Duration,
}

/// What the monitor saw over the lifetime of the process.
#[derive(Debug, Clone, Copy)]
pub struct Watch {
    pub status: ExitStatus,
    pub exceeded: bool,
    pub peak_kb: u64,
}

impl MemoryMonitor {
    pub fn new(limit_mb: u64, interval: Duration) -> Self {
        Self {
            limit_kb: limit_mb * 1024,
            interval,
        }
    }

    /// Watch `child` until it exits, killing it on the first sample over the ceiling.
    ///
    /// The sampling loop lives inside this future: it stops as soon as the
    /// process exits or the future is dropped (e.g. by a wall-clock timeout).
    pub async fn watch(&self, child: &mut Child) -> io::Result<Watch> {
        let pid = child.id();
        let mut peak_kb = 0;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                status = child.wait() => {
                    return Ok(Watch { status: status?, exceeded: false, peak_kb });
                }
                _ = ticker.tick() => {
                    let Some(rss_kb) = pid.and_then(footprint_kb) else {
                        continue;
                    };
                    peak_kb = peak_kb.max(rss_kb);

                    if rss_kb > self.limit_kb {
                        warn!(pid = ?pid, rss_kb, limit_kb = self.limit_kb, "Memory ceiling exceeded, killing process");
                        // Exited between sample and kill: nothing left to stop
                        if let Err(e) = child.start_kill() {
                            debug!(pid = ?pid, error = %e, "Kill after memory breach was a no-op");
                        }
                        let status = child.wait().await?;
                        return Ok(Watch { status, exceeded: true, peak_kb });
                    }
                }
            }
        }
    }
}

/// Resident memory charged to `pid`: the whole group when it is a group
/// leader, the process alone otherwise.
fn footprint_kb(pid: u32) -> Option<u64> {
    let own = resident_kb(pid)?;
    match process_group(pid) {
        Some(pgid) if pgid == pid => Some(group_resident_kb(pgid).max(own)),
        _ => Some(own),
    }
}

/// Sum of VmRSS over every live process whose group is `pgid`.
pub fn group_resident_kb(pgid: u32) -> u64 {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };

    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| process_group(pid) == Some(pgid))
        .filter_map(resident_kb)
        .sum()
}

/// Process group of `pid`, from `/proc/<pid>/stat`.
fn process_group(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_pgrp(&stat)
}

/// `pid (comm) state ppid pgrp ...`; comm may itself contain spaces and parens.
fn parse_pgrp(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// Resident set size of `pid` in kB, or `None` once the process is gone.
pub fn resident_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::process::Command;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tpython3\nVmPeak:\t  20000 kB\nVmRSS:\t   9876 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(9876));
        // Zombies have no VmRSS line
        assert_eq!(parse_vm_rss("Name:\tsh\nState:\tZ (zombie)\n"), None);
    }

    #[test]
    fn test_parse_pgrp() {
        assert_eq!(parse_pgrp("4242 (sh) S 4200 4242 4200 0 -1 4194560"), Some(4242));
        assert_eq!(parse_pgrp("77 (weird ) name) R 1 70 70 0"), Some(70));
        assert_eq!(parse_pgrp("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_group_members_are_measured() {
        // The leader stays small; the allocation happens in a nested shell
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sh -c 'x=$(head -c 60000000 /dev/zero | tr \"\\\\0\" a); sleep 5'; true")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let monitor = MemoryMonitor::new(10, Duration::from_millis(10));

        let started = Instant::now();
        let watch = monitor.watch(&mut child).await.unwrap();
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );

        assert!(watch.exceeded);
        assert!(watch.peak_kb > 10 * 1024);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_kills_process_over_ceiling() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        // Any live process uses more than 0 kB
        let monitor = MemoryMonitor::new(0, Duration::from_millis(10));

        let started = Instant::now();
        let watch = monitor.watch(&mut child).await.unwrap();

        assert!(watch.exceeded);
        assert!(!watch.status.success());
        assert!(watch.peak_kb > 0);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stops_when_process_exits() {
        let mut child = Command::new("sh").arg("-c").arg("exit 3").spawn().unwrap();
        let monitor = MemoryMonitor::new(1024, Duration::from_millis(10));

        let watch = monitor.watch(&mut child).await.unwrap();

        assert!(!watch.exceeded);
        assert_eq!(watch.status.code(), Some(3));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropping_watch_stops_sampling() {
        let mut child = Command::new("sleep").arg("5").kill_on_drop(true).spawn().unwrap();
        let monitor = MemoryMonitor::new(1024, Duration::from_millis(10));

        let timed = tokio::time::timeout(Duration::from_millis(100), monitor.watch(&mut child)).await;
        assert!(timed.is_err());

        child.kill().await.unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }
}
