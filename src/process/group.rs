//! Process-group teardown.
//!
//! Every external tool is spawned as the leader of its own process group so
//! that a timeout or cancellation reaches the grandchildren too (test
//! runners with worker processes, shell wrappers).

use std::time::Duration;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tracing::debug;

/// Kills a process group when dropped, unless disarmed.
///
/// Drop sends SIGTERM immediately and SIGKILL after the grace period from a
/// detached thread, since `Drop` cannot await.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pgid: Option<i32>,
    grace: Duration,
    armed: bool,
}

impl ProcessGroupGuard {
    /// Guard for the group led by `pid` (the child's pid when spawned with
    /// `process_group(0)`).
    pub fn new(pid: Option<u32>, grace: Duration) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
            grace,
            armed: true,
        }
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    /// Leave the group alone on drop.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// Send SIGTERM to the group.
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            signal_group(pgid, Signal::SIGTERM);
        }
    }

    /// Send SIGKILL to the group.
    pub fn kill(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            signal_group(pgid, Signal::SIGKILL);
        }
    }

    /// Whether any member of the group is still alive.
    pub fn is_alive(&self) -> bool {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            return group_alive(pgid);
        }
        false
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            debug!(pgid, "tearing down abandoned process group");
            signal_group(pgid, Signal::SIGTERM);
            let grace = self.grace;
            std::thread::spawn(move || {
                std::thread::sleep(grace);
                if group_alive(pgid) {
                    signal_group(pgid, Signal::SIGKILL);
                }
            });
        }
    }
}

/// Signal every process in group `pgid`. Returns false if the group is gone.
#[cfg(unix)]
pub fn signal_group(pgid: i32, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            debug!(pgid, ?signal, error = %err, "failed to signal process group");
            false
        }
    }
}

/// Null-signal probe of a process group.
#[cfg(unix)]
pub fn group_alive(pgid: i32) -> bool {
    match killpg(Pid::from_raw(pgid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
