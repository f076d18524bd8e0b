//! Parent-side client for the spawner sidecar.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nix::sys::socket::MsgFlags;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, warn};

use super::config::SpawnConfig;
use super::prepared::PreparedChildProcess;
use super::protocol::{
    self, Payload, ProtocolError, RequestCommand, ResponseCommand, Serializer,
};

/// How long a killed child may linger before the fallback `SIGKILL`.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("uid/gid not allowed: {uid}/{gid}")]
    CredentialsRejected { uid: u32, gid: u32 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The spawner socket is gone; no more children can be started.
    #[error("the spawner is gone")]
    SpawnerGone,

    #[error("spawner I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct ProcessEntry {
    exit_tx: watch::Sender<Option<i32>>,
}

struct ClientState {
    processes: HashMap<i32, ProcessEntry>,
    shutting_down: bool,
}

/// Sends spawn requests to the sidecar and fans incoming `EXIT`
/// messages out to the per-child exit listeners.
pub struct SpawnClient {
    config: SpawnConfig,
    socket: AsyncFd<OwnedFd>,
    dead: AtomicBool,
    next_id: AtomicI32,
    state: Mutex<ClientState>,

    /// Global admission queue: bounds the number of simultaneous
    /// clone() requests across all pools.
    admission: Semaphore,
}

impl SpawnClient {
    /// `socket` is our half of the `SOCK_SEQPACKET` pair whose other
    /// half the sidecar holds.  Must be called inside a tokio
    /// runtime.
    pub fn new(
        socket: OwnedFd,
        config: SpawnConfig,
        admission_limit: usize,
    ) -> std::io::Result<Arc<Self>> {
        nix::sys::socket::setsockopt(&socket, nix::sys::socket::sockopt::RcvBuf, &(256 * 1024))
            .ok();

        let client = Arc::new(Self {
            config,
            socket: AsyncFd::new(socket)?,
            dead: AtomicBool::new(false),
            next_id: AtomicI32::new(1),
            state: Mutex::new(ClientState {
                processes: HashMap::new(),
                shutting_down: false,
            }),
            admission: Semaphore::new(admission_limit.max(1)),
        });

        let reader = Arc::downgrade(&client);
        tokio::spawn(async move { read_loop(reader).await });

        Ok(client)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// Initiate shutdown: once the process table drains, the client
    /// closes its socket, which the sidecar takes as its own shutdown
    /// signal.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        if state.processes.is_empty() {
            self.dead.store(true, Ordering::Relaxed);
        }
    }

    fn check(&self) -> Result<(), SpawnError> {
        if self.is_dead() {
            return Err(SpawnError::SpawnerGone);
        }
        Ok(())
    }

    async fn send(&self, s: &Serializer) -> Result<(), SpawnError> {
        loop {
            let mut guard = self
                .socket
                .ready(Interest::WRITABLE)
                .await
                .map_err(SpawnError::Io)?;

            match protocol::send_message(self.socket.get_ref().as_fd(), s.payload(), s.fds()) {
                Ok(()) => return Ok(()),
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready_matching(tokio::io::Ready::WRITABLE);
                    continue;
                }
                Err(e) => {
                    self.dead.store(true, Ordering::Relaxed);
                    return Err(SpawnError::Io(e.into()));
                }
            }
        }
    }

    fn try_send(&self, s: &Serializer) -> Result<(), SpawnError> {
        protocol::send_message(self.socket.get_ref().as_fd(), s.payload(), s.fds())
            .map_err(|e| SpawnError::Io(e.into()))
    }

    /// Ask the sidecar to spawn a child process.  Suspends in the
    /// global admission queue first; cancellation before admission
    /// releases the slot without waking other waiters.
    pub async fn spawn_child(
        self: &Arc<Self>,
        name: &str,
        mut p: PreparedChildProcess,
    ) -> Result<ChildHandle, SpawnError> {
        /* this check is performed again in the sidecar (which is the
           only place it is authoritative); this one only surfaces the
           error earlier in the call chain */
        if !p.uid_gid.is_empty() && !self.config.verify(&p.uid_gid) {
            return Err(SpawnError::CredentialsRejected {
                uid: p.uid_gid.uid,
                gid: p.uid_gid.gid,
            });
        }

        self.check()?;

        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| SpawnError::SpawnerGone)?;

        self.check()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_i32(id)?;
        s.write_string(name)?;
        protocol::serialize_exec(&mut s, &mut p)?;

        self.send(&s).await?;

        let (exit_tx, exit_rx) = watch::channel(None);
        self.state
            .lock()
            .processes
            .insert(id, ProcessEntry { exit_tx });

        debug!(id, name, "spawn request sent");

        Ok(ChildHandle {
            id,
            name: name.to_owned(),
            client: Arc::downgrade(self),
            exit: exit_rx,
            killed: false,
        })
    }

    /// Hand out a private sub-channel: the sidecar spawns a fresh
    /// connection handler on the peer of the returned socket.
    pub async fn connect(&self) -> Result<OwnedFd, SpawnError> {
        use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

        self.check()?;

        let (local, remote) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )
        .map_err(std::io::Error::from)?;

        let mut s = Serializer::request(RequestCommand::Connect);
        s.push_fd(remote)?;
        self.send(&s).await?;

        Ok(local)
    }

    /// Send a signal to a child.  A fallback `SIGKILL` is scheduled
    /// in case the child ignores it.
    pub fn kill(self: &Arc<Self>, id: i32, signo: i32) {
        if self.check().is_err() {
            return;
        }

        let mut s = Serializer::request(RequestCommand::Kill);
        if s.write_i32(id).and_then(|()| s.write_i32(signo)).is_err() {
            return;
        }

        if let Err(e) = self.try_send(&s) {
            warn!(id, signo, "failed to send KILL to spawner: {e}");
            return;
        }

        if signo == libc::SIGKILL {
            return;
        }

        let exit = {
            let state = self.state.lock();
            state.processes.get(&id).map(|e| e.exit_tx.subscribe())
        };

        if let (Some(mut exit), Ok(handle)) = (exit, tokio::runtime::Handle::try_current()) {
            let client = Arc::clone(self);
            handle.spawn(async move {
                tokio::select! {
                    _ = exit.wait_for(Option::is_some) => {}
                    () = tokio::time::sleep(KILL_TIMEOUT) => {
                        warn!(id, "child ignored signal, sending SIGKILL");
                        client.kill(id, libc::SIGKILL);
                    }
                }
            });
        }
    }

    fn handle_exit(&self, id: i32, status: i32) {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.processes.remove(&id);
            if state.shutting_down && state.processes.is_empty() {
                self.dead.store(true, Ordering::Relaxed);
            }
            entry
        };

        match entry {
            Some(entry) => {
                debug!(id, status, "child process exited");
                let _ = entry.exit_tx.send(Some(status));
            }
            None => debug!(id, status, "exit for unknown child"),
        }
    }

    fn forget(&self, id: i32) {
        self.state.lock().processes.remove(&id);
    }
}

async fn read_loop(client: Weak<SpawnClient>) {
    loop {
        let Some(strong) = client.upgrade() else {
            return;
        };

        let readable = strong.socket.readable();
        let result = readable.await;
        let mut guard = match result {
            Ok(guard) => guard,
            Err(e) => {
                error!("spawner socket failed: {e}");
                strong.dead.store(true, Ordering::Relaxed);
                return;
            }
        };

        /* drain everything that is ready */
        loop {
            let mut buffer = [0u8; 64];
            match protocol::receive_message(
                strong.socket.get_ref().as_fd(),
                &mut buffer,
                MsgFlags::MSG_DONTWAIT,
            ) {
                Ok((0, _)) => {
                    error!("spawner closed the socket");
                    strong.dead.store(true, Ordering::Relaxed);
                    return;
                }
                Ok((n, _fds)) => {
                    if let Err(e) = handle_response(&strong, &buffer[..n]) {
                        error!("malformed spawner response: {e}");
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready_matching(tokio::io::Ready::READABLE);
                    break;
                }
                Err(e) => {
                    error!("recvmsg() from spawner failed: {e}");
                    strong.dead.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

fn handle_response(client: &SpawnClient, payload: &[u8]) -> Result<(), ProtocolError> {
    let mut payload = Payload::new(payload);
    match ResponseCommand::try_from(payload.read_byte()?)? {
        ResponseCommand::Exit => {
            let id = payload.read_i32()?;
            let status = payload.read_i32()?;
            if !payload.is_empty() {
                return Err(ProtocolError::Malformed);
            }

            client.handle_exit(id, status);
            Ok(())
        }
    }
}

/// A handle for one spawned child process.  Dropping the handle kills
/// the child.
pub struct ChildHandle {
    id: i32,
    name: String,
    client: Weak<SpawnClient>,
    exit: watch::Receiver<Option<i32>>,
    killed: bool,
}

impl ChildHandle {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wait-status if the child has already exited.
    pub fn exit_status(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// A listener resolving with the child's wait-status.
    pub fn exit_listener(&self) -> ExitListener {
        ExitListener {
            exit: self.exit.clone(),
        }
    }

    pub fn kill(&mut self, signo: i32) {
        self.killed = true;
        if let Some(client) = self.client.upgrade() {
            client.kill(self.id, signo);
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if self.killed || self.exit_status().is_some() {
            if let Some(client) = self.client.upgrade() {
                client.forget(self.id);
            }
            return;
        }

        if let Some(client) = self.client.upgrade() {
            debug!(id = self.id, name = %self.name, "killing abandoned child");
            client.kill(self.id, libc::SIGTERM);
        }
    }
}

/// Resolves once the associated child process has exited.
#[derive(Clone)]
pub struct ExitListener {
    exit: watch::Receiver<Option<i32>>,
}

impl ExitListener {
    pub async fn wait(&mut self) -> i32 {
        match self.exit.wait_for(Option::is_some).await {
            Ok(status) => status.expect("wait_for() guarantees Some"),
            /* the client is gone; treat as killed */
            Err(_) => libc::SIGKILL,
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit.borrow()
    }
}
