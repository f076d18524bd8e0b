//! The spawner's table of live child processes.
//!
//! All reaping happens here, in the sidecar process: `SIGCHLD` wakes
//! the server loop, which calls `reap()` and routes each exit back to
//! the connection that requested the spawn.

use std::collections::HashMap;
use std::time::Instant;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::client::KILL_TIMEOUT;

/// Where an exit report must be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRoute {
    /// The connection that issued the `EXEC`.
    pub connection: u64,

    /// The request id within that connection.
    pub id: i32,
}

struct ChildEntry {
    name: String,
    route: Option<ExitRoute>,
    start_time: Instant,

    /// When set, the child has been signalled and gets a `SIGKILL`
    /// at this deadline.
    kill_deadline: Option<Instant>,
}

/// One reaped exit, ready to be reported.
pub struct ReapedChild {
    pub route: Option<ExitRoute>,
    pub status: i32,
}

#[derive(Default)]
pub struct ChildRegistry {
    children: HashMap<libc::pid_t, ChildEntry>,

    /// In volatile mode an empty registry allows the process to shut
    /// down.
    volatile: bool,
}

impl ChildRegistry {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn set_volatile(&mut self) {
        self.volatile = true;
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    pub fn add(&mut self, pid: Pid, name: &str, route: Option<ExitRoute>) {
        debug!(pid = pid.as_raw(), name, "added child process");

        self.children.insert(
            pid.as_raw(),
            ChildEntry {
                name: name.to_owned(),
                route,
                start_time: Instant::now(),
                kill_deadline: None,
            },
        );
    }

    /// Send a signal and arm the fallback `SIGKILL` timer.
    pub fn kill(&mut self, pid: Pid, signo: Signal) {
        let Some(entry) = self.children.get_mut(&pid.as_raw()) else {
            return;
        };

        debug!(pid = pid.as_raw(), name = %entry.name, ?signo, "signalling child process");

        if let Err(e) = kill(pid, signo) {
            warn!(pid = pid.as_raw(), name = %entry.name, "failed to kill child process: {e}");

            /* if we can't kill the process, we can't do much; drop it
               so it cannot delay the shutdown */
            self.children.remove(&pid.as_raw());
            return;
        }

        entry.kill_deadline = Some(Instant::now() + KILL_TIMEOUT);
    }

    /// Find the pid of the child a connection spawned under the
    /// given request id.
    pub fn find_route(&self, connection: u64, id: i32) -> Option<Pid> {
        self.children
            .iter()
            .find(|(_, e)| e.route == Some(ExitRoute { connection, id }))
            .map(|(&pid, _)| Pid::from_raw(pid))
    }

    /// Kill all children routed to the given connection (used when a
    /// connection goes away).
    pub fn kill_connection(&mut self, connection: u64) {
        let pids: Vec<libc::pid_t> = self
            .children
            .iter()
            .filter(|(_, e)| e.route.is_some_and(|r| r.connection == connection))
            .map(|(&pid, _)| pid)
            .collect();

        for pid in pids {
            if let Some(entry) = self.children.get_mut(&pid) {
                entry.route = None;
            }
            self.kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }

    /// The next fallback-kill deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.children
            .values()
            .filter_map(|e| e.kill_deadline)
            .min()
    }

    /// Fire overdue fallback kills.
    pub fn handle_deadlines(&mut self) {
        let now = Instant::now();
        let overdue: Vec<libc::pid_t> = self
            .children
            .iter()
            .filter(|(_, e)| e.kill_deadline.is_some_and(|d| d <= now))
            .map(|(&pid, _)| pid)
            .collect();

        for pid in overdue {
            if let Some(entry) = self.children.get_mut(&pid) {
                warn!(pid, name = %entry.name, "sending SIGKILL to child process due to timeout");
                entry.kill_deadline = None;
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    warn!(pid, "failed to SIGKILL child process: {e}");
                }
            }
        }
    }

    /// Reap all exited children with `wait4(WNOHANG)`.
    pub fn reap(&mut self) -> Vec<ReapedChild> {
        let mut reaped = Vec::new();

        loop {
            let mut status: libc::c_int = 0;
            let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };

            let pid =
                unsafe { libc::wait4(-1, &mut status, libc::WNOHANG, &mut rusage) };
            if pid <= 0 {
                break;
            }

            let Some(entry) = self.children.remove(&pid) else {
                debug!(pid, "reaped unknown process");
                continue;
            };

            log_exit(pid, &entry, status, &rusage);
            reaped.push(ReapedChild {
                route: entry.route,
                status,
            });
        }

        reaped
    }
}

fn log_exit(pid: libc::pid_t, entry: &ChildEntry, status: i32, rusage: &libc::rusage) {
    let name = entry.name.as_str();

    if libc::WIFSIGNALED(status) {
        warn!(
            pid,
            name,
            signal = libc::WTERMSIG(status),
            core_dumped = libc::WCOREDUMP(status),
            "child process died from signal"
        );
    } else if libc::WEXITSTATUS(status) == 0 {
        debug!(pid, name, "child process exited with success");
    } else {
        warn!(
            pid,
            name,
            status = libc::WEXITSTATUS(status),
            "child process exited with error"
        );
    }

    let elapsed = entry.start_time.elapsed();
    debug!(
        pid,
        name,
        elapsed_s = elapsed.as_secs_f64(),
        user_s = timeval_to_secs(&rusage.ru_utime),
        sys_s = timeval_to_secs(&rusage.ru_stime),
        minflt = rusage.ru_minflt,
        majflt = rusage.ru_majflt,
        "child process resource usage"
    );
}

fn timeval_to_secs(tv: &libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_tracking() {
        let mut registry = ChildRegistry::default();
        assert!(registry.next_deadline().is_none());
        assert!(registry.is_empty());

        registry.add(Pid::from_raw(4242), "test", None);
        assert!(!registry.is_empty());
        assert!(registry.next_deadline().is_none());
    }

    #[test]
    fn volatile_mode() {
        let mut registry = ChildRegistry::default();
        assert!(!registry.is_volatile());
        registry.set_volatile();
        assert!(registry.is_volatile());
    }
}
