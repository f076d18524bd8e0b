//! Forking the spawner sidecar.
//!
//! The sidecar must be started before the async runtime and before
//! any privileges are dropped; it keeps the capabilities the main
//! process gives up.

use std::os::fd::OwnedFd;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::unistd::{ForkResult, fork};

use super::cgroup::CgroupState;
use super::config::SpawnConfig;
use super::server::run_spawn_server;

/// Fork the spawner sidecar.  Returns the parent's half of the
/// control socket; pass it to `SpawnClient::new()` once the runtime
/// is up.
pub fn launch_spawn_server(
    config: &SpawnConfig,
    cgroup_state: CgroupState,
) -> std::io::Result<OwnedFd> {
    let (parent_fd, child_fd) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
    .map_err(std::io::Error::from)?;

    // SAFETY: called before the runtime starts, while the process is
    // still single-threaded
    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Parent { child: _ } => {
            drop(child_fd);
            Ok(parent_fd)
        }

        ForkResult::Child => {
            drop(parent_fd);

            let _ = unsafe {
                libc::prctl(
                    libc::PR_SET_NAME,
                    c"spawn".as_ptr() as libc::c_ulong,
                    0,
                    0,
                    0,
                )
            };

            run_spawn_server(config.clone(), cgroup_state, child_fd);
        }
    }
}

/// Discover the delegated cgroup the spawner may create sub-groups
/// in, from our own `/proc/self/cgroup`.
pub fn detect_cgroup_state() -> CgroupState {
    let Ok(contents) = std::fs::read_to_string("/proc/self/cgroup") else {
        return CgroupState::default();
    };

    /* cgroup2 unified hierarchy: "0::/path" */
    for line in contents.lines() {
        if let Some(path) = line.strip_prefix("0::") {
            return CgroupState {
                group_path: path.to_owned(),
            };
        }
    }

    CgroupState::default()
}
