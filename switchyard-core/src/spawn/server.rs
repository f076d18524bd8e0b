//! The spawner sidecar: a privilege-separated process that performs
//! the actual clone()/execve() work.
//!
//! The sidecar owns one end of a `SOCK_SEQPACKET` pair; every
//! datagram is parsed, the sandbox is applied inside the cloned
//! child, and exits are reported back with `EXIT` datagrams.  The
//! parent's half of the socket going away is the shutdown signal.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll, ppoll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction, signal};
use nix::sys::socket::MsgFlags;
use nix::sys::time::TimeSpec;
use nix::unistd::{Pid, pipe};
use tracing::{debug, error, info, warn};

use super::cgroup::CgroupState;
use super::config::SpawnConfig;
use super::prepared::PreparedChildProcess;
use super::protocol::{
    self, FdList, Payload, ProtocolError, RequestCommand, ResponseCommand, Serializer,
};
use super::registry::{ChildRegistry, ExitRoute};

/// The fd number the backend control channel is passed on.
const CONTROL_FILENO: RawFd = 3;

/// Exit status reported for a spawn the sidecar refused.
const REFUSED_STATUS: i32 = 0xff00;

static SIGCHLD_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn sigchld_handler(_: libc::c_int) {
    let fd = SIGCHLD_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        let _ = unsafe { libc::write(fd, [0u8].as_ptr().cast(), 1) };
    }
}

struct Connection {
    socket: OwnedFd,
}

struct SpawnServer {
    config: SpawnConfig,
    cgroup_state: CgroupState,

    connections: HashMap<u64, Connection>,
    next_connection: u64,

    registry: ChildRegistry,

    sigchld_read: OwnedFd,
}

/// Run the spawner.  Never returns; the process exits when the last
/// connection is gone and all children have been reaped.
pub fn run_spawn_server(config: SpawnConfig, cgroup_state: CgroupState, socket: OwnedFd) -> ! {
    /* ignore all signals which may stop us; shut down only when all
       sockets are closed */
    for sig in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ] {
        let _ = unsafe { signal(sig, SigHandler::SigIgn) };
    }

    let (sigchld_read, sigchld_write) = pipe().expect("pipe() failed");
    set_nonblocking(&sigchld_read);
    set_nonblocking(&sigchld_write);
    SIGCHLD_PIPE.store(sigchld_write.as_raw_fd(), Ordering::Relaxed);
    std::mem::forget(sigchld_write);

    let action = SigAction::new(
        SigHandler::Handler(sigchld_handler),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }.expect("sigaction(SIGCHLD) failed");

    let mut server = SpawnServer {
        config,
        cgroup_state,
        connections: HashMap::new(),
        next_connection: 0,
        registry: ChildRegistry::default(),
        sigchld_read,
    };

    server.add_connection(socket);
    server.run();
}

fn set_nonblocking(fd: &OwnedFd) {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};

    if let Ok(flags) = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL) {
        let _ = fcntl(
            fd.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        );
    }
}

impl SpawnServer {
    fn add_connection(&mut self, socket: OwnedFd) {
        let serial = self.next_connection;
        self.next_connection += 1;
        self.connections.insert(serial, Connection { socket });
    }

    fn run(&mut self) -> ! {
        info!("spawner ready");

        loop {
            if self.connections.is_empty() {
                /* all connections are gone */
                self.registry.set_volatile();
                if self.registry.is_empty() {
                    info!("spawner shutting down");
                    std::process::exit(0);
                }
            }

            let timeout = match self.registry.next_deadline() {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let millis = remaining.min(Duration::from_secs(60)).as_millis() as u16;
                    PollTimeout::from(millis.max(1))
                }
                None => PollTimeout::NONE,
            };

            let serials: Vec<u64> = self.connections.keys().copied().collect();

            let mut pollfds = Vec::with_capacity(serials.len() + 1);
            pollfds.push(PollFd::new(self.sigchld_read.as_fd(), PollFlags::POLLIN));
            for serial in &serials {
                pollfds.push(PollFd::new(
                    self.connections[serial].socket.as_fd(),
                    PollFlags::POLLIN,
                ));
            }

            match poll(&mut pollfds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(e) => {
                    error!("poll() failed: {e}");
                    std::process::exit(1);
                }
            }

            let mut ready = Vec::new();
            let sigchld_ready = pollfds[0]
                .revents()
                .is_some_and(|r| !r.is_empty());
            for (i, serial) in serials.iter().enumerate() {
                if pollfds[i + 1].revents().is_some_and(|r| !r.is_empty()) {
                    ready.push(*serial);
                }
            }
            drop(pollfds);

            if sigchld_ready {
                self.drain_sigchld_pipe();
                self.reap();
            }

            for serial in ready {
                self.handle_connection(serial);
            }

            self.registry.handle_deadlines();
        }
    }

    fn drain_sigchld_pipe(&self) {
        let mut buffer = [0u8; 64];
        while nix::unistd::read(self.sigchld_read.as_raw_fd(), &mut buffer).is_ok_and(|n| n > 0) {}
    }

    fn reap(&mut self) {
        for reaped in self.registry.reap() {
            let Some(route) = reaped.route else {
                continue;
            };

            if !self.send_exit(route.connection, route.id, reaped.status) {
                self.remove_connection(route.connection);
            }
        }
    }

    fn handle_connection(&mut self, serial: u64) {
        let Some(connection) = self.connections.get(&serial) else {
            return;
        };

        let mut buffer = vec![0u8; protocol::MAX_DATAGRAM];
        let (n, fds) = match protocol::receive_message(
            connection.socket.as_fd(),
            &mut buffer,
            MsgFlags::MSG_DONTWAIT,
        ) {
            Ok((0, _)) => {
                debug!(serial, "connection closed");
                self.remove_connection(serial);
                return;
            }
            Ok(r) => r,
            Err(Errno::EAGAIN) => return,
            Err(e) => {
                warn!(serial, "recvmsg() failed: {e}");
                self.remove_connection(serial);
                return;
            }
        };

        let mut fds = FdList::new(fds);
        if let Err(e) = self.handle_message(serial, &buffer[..n], &mut fds) {
            warn!(serial, "malformed spawn payload: {e}");
        }
    }

    fn handle_message(
        &mut self,
        serial: u64,
        payload: &[u8],
        fds: &mut FdList,
    ) -> Result<(), ProtocolError> {
        let mut payload = Payload::new(payload);

        match RequestCommand::try_from(payload.read_byte()?)? {
            RequestCommand::Connect => {
                if !payload.is_empty() || fds.len() != 1 {
                    return Err(ProtocolError::Malformed);
                }

                self.add_connection(fds.get()?);
                Ok(())
            }

            RequestCommand::Exec => self.handle_exec(serial, &mut payload, fds),

            RequestCommand::Kill => {
                if !fds.is_empty() {
                    return Err(ProtocolError::Malformed);
                }

                let id = payload.read_i32()?;
                let signo = payload.read_i32()?;
                if !payload.is_empty() {
                    return Err(ProtocolError::Malformed);
                }

                self.handle_kill(serial, id, signo);
                Ok(())
            }
        }
    }

    fn handle_exec(
        &mut self,
        serial: u64,
        payload: &mut Payload<'_>,
        fds: &mut FdList,
    ) -> Result<(), ProtocolError> {
        let id = payload.read_i32()?;
        let name = payload.read_string()?.to_owned();

        let p = protocol::parse_exec(payload, fds)?;

        /* the client performs the same check, but only this one is
           authoritative */
        if !p.uid_gid.is_empty() && !self.config.verify(&p.uid_gid) {
            warn!(
                name,
                uid = p.uid_gid.uid,
                gid = p.uid_gid.gid,
                "uid/gid not allowed"
            );
            self.report_failure(serial, id);
            return Ok(());
        }

        match spawn_child_process(p, &self.config, &self.cgroup_state) {
            Ok(pid) => {
                self.registry.add(
                    pid,
                    &name,
                    Some(ExitRoute {
                        connection: serial,
                        id,
                    }),
                );
            }
            Err(e) => {
                warn!(name, "failed to spawn child process: {e}");
                self.report_failure(serial, id);
            }
        }

        Ok(())
    }

    fn report_failure(&mut self, serial: u64, id: i32) {
        if !self.send_exit(serial, id, REFUSED_STATUS) {
            self.remove_connection(serial);
        }
    }

    fn handle_kill(&mut self, serial: u64, id: i32, signo: i32) {
        let Ok(signo) = Signal::try_from(signo) else {
            return;
        };

        if let Some(pid) = self.registry.find_route(serial, id) {
            self.registry.kill(pid, signo);
        }
    }

    /// Send an `EXIT` datagram.  When the client is busy and the
    /// datagram queue has filled, wait with all signals blocked for
    /// up to 10 seconds and retry once; there is no queuing.
    fn send_exit(&self, serial: u64, id: i32, status: i32) -> bool {
        let Some(connection) = self.connections.get(&serial) else {
            return true;
        };

        let mut s = Serializer::response(ResponseCommand::Exit);
        if s.write_i32(id).and_then(|()| s.write_i32(status)).is_err() {
            return false;
        }

        match protocol::send_message(connection.socket.as_fd(), s.payload(), s.fds()) {
            Ok(()) => true,
            Err(Errno::EAGAIN) => {
                let mut pollfds = [PollFd::new(connection.socket.as_fd(), PollFlags::POLLOUT)];
                let timeout = TimeSpec::new(10, 0);

                /* ignore all signals while waiting, or else the poll
                   may be interrupted too early by the next SIGCHLD */
                let all_signals = SigSet::all();

                if ppoll(&mut pollfds, Some(timeout), Some(all_signals)).is_ok_and(|n| n > 0)
                    && protocol::send_message(connection.socket.as_fd(), s.payload(), s.fds())
                        .is_ok()
                {
                    return true;
                }

                error!(serial, id, "failed to send EXIT to client");
                false
            }
            Err(e) => {
                error!(serial, id, "failed to send EXIT to client: {e}");
                false
            }
        }
    }

    fn remove_connection(&mut self, serial: u64) {
        if self.connections.remove(&serial).is_some() {
            self.registry.kill_connection(serial);
        }
    }
}

/// Clone a new child process and run the sandbox setup plus `execve`
/// inside it.
fn spawn_child_process(
    mut p: PreparedChildProcess,
    config: &SpawnConfig,
    cgroup_state: &CgroupState,
) -> Result<Pid, std::io::Error> {
    let path = p.finish();
    if path.is_empty() {
        return Err(std::io::Error::other("no executable path"));
    }

    let clone_flags = p.ns.clone_flags(config);

    let mut stack = vec![0u8; 32768];

    let config = config.clone();
    let cgroup_state = cgroup_state.clone();

    let cb = Box::new(move || {
        exec_child(&path, &p, &config, &cgroup_state);
        /* exec_child only returns on error and has already printed a
           diagnostic */
        2
    });

    // SAFETY: the child immediately execs; the callback does not
    // return to the caller's stack frame
    let pid = unsafe {
        nix::sched::clone(
            cb,
            &mut stack,
            clone_flags,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(std::io::Error::from)?;

    Ok(pid)
}

/// The child side of the spawn: apply the sandbox in order, then
/// exec.  Any failing step prints a diagnostic to stderr and exits
/// with status 2.
fn exec_child(
    path: &str,
    p: &PreparedChildProcess,
    config: &SpawnConfig,
    cgroup_state: &CgroupState,
) {
    fn die(step: &str, e: impl std::fmt::Display) -> ! {
        eprintln!("{step}: {e}");
        std::process::exit(2);
    }

    if let Err(e) = p.cgroup.apply(cgroup_state) {
        die("cgroup setup failed", e);
    }

    if let Err(e) = p.refence.apply() {
        die("refence setup failed", e);
    }

    if let Err(e) = p.ns.setup(config, &p.uid_gid) {
        die("namespace setup failed", e);
    }

    if let Some(chroot) = &p.chroot
        && let Err(e) = nix::unistd::chroot(chroot.as_str())
    {
        die("chroot() failed", e);
    }

    if let Err(e) = p.rlimits.apply() {
        die("setrlimit() failed", e);
    }

    if !p.uid_gid.is_empty() {
        if let Err(e) = p.uid_gid.apply() {
            die("failed to drop privileges", e);
        }
    } else if config.ignore_userns
        && let Err(e) = config.default_uid_gid.apply()
    {
        die("failed to drop privileges", e);
    }

    if p.no_new_privs {
        let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if ret < 0 {
            die("PR_SET_NO_NEW_PRIVS failed", std::io::Error::last_os_error());
        }
    }

    if p.priority != 0 {
        let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, p.priority) };
        if ret < 0 {
            die("setpriority() failed", std::io::Error::last_os_error());
        }
    }

    checked_dup2(p.stdin.as_ref(), libc::STDIN_FILENO);
    checked_dup2(p.stdout.as_ref(), libc::STDOUT_FILENO);
    checked_dup2(p.stderr.as_ref(), libc::STDERR_FILENO);
    checked_dup2(p.control.as_ref(), CONTROL_FILENO);

    let Ok(exec_path) = CString::new(path) else {
        die("malformed executable path", path);
    };

    let args: Vec<CString> = p
        .args
        .iter()
        .filter_map(|a| CString::new(a.as_str()).ok())
        .collect();
    let env: Vec<CString> = p
        .env
        .iter()
        .filter_map(|e| CString::new(e.as_str()).ok())
        .collect();

    let e = nix::unistd::execve(&exec_path, &args, &env).unwrap_err();
    die(&format!("failed to execute {path}"), e);
}

fn checked_dup2(fd: Option<&OwnedFd>, target: RawFd) {
    let Some(fd) = fd else { return };

    if fd.as_raw_fd() == target {
        /* clear CLOEXEC so the child keeps it */
        unsafe {
            let flags = libc::fcntl(target, libc::F_GETFD);
            libc::fcntl(target, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    } else {
        unsafe {
            libc::dup2(fd.as_raw_fd(), target);
        }
    }
}
