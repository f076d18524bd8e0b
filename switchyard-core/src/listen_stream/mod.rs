//! On-demand listener sockets whose first connection triggers a
//! translation-server lookup and a spawn.
//!
//! When the translation server names a container-local path as a
//! listener the child expects to inherit, this stock owns the real
//! socket outside the container.  The first accept-readiness asks the
//! handler (which consults the translation server) for a process to
//! spawn; that process inherits the listener.  After the process
//! exits, the entry backs off briefly and listens again as long as
//! anyone still holds a lease.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use nix::sys::socket::SockType;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::net::TempListener;
use crate::spawn::ChildHandle;
use crate::spawn::mount::Mount;
use crate::spawn::namespace::NamespaceOptions;
use crate::string_list::string_list_contains;

/// Backoff before re-listening after the child exited.
const COOLING_INTERVAL: Duration = Duration::from_secs(10);

/// How long an unused entry is kept around.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error, Clone)]
pub enum ListenStreamError {
    #[error("malformed listener socket path")]
    MalformedPath,

    /// Translation or spawn failure, sticky until the entry dies.
    #[error("{0}")]
    Handler(Arc<str>),

    #[error("listener I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for ListenStreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// What the handler produced: a running child process plus its tag
/// list.
pub struct ListenStreamServer {
    pub handle: ChildHandle,
    pub tags: String,
}

/// Consulted on the first connection to an idle listener; expected to
/// ask the translation server and spawn the described process with
/// the socket as its stdin.
pub trait ListenStreamHandler: Send + Sync + 'static {
    fn ready(
        &self,
        key: String,
        socket_path: PathBuf,
        socket: OwnedFd,
    ) -> BoxFuture<'static, Result<ListenStreamServer, ListenStreamError>>;
}

struct EntryShared {
    key: String,
    path: PathBuf,

    tags: Mutex<String>,

    fade: AtomicBool,
    error: Mutex<Option<ListenStreamError>>,

    leases: AtomicUsize,
    changed: Notify,
}

impl EntryShared {
    fn is_faded(&self) -> bool {
        self.fade.load(Ordering::Relaxed)
    }

    fn fade(&self) {
        self.fade.store(true, Ordering::Relaxed);
        self.changed.notify_waiters();
    }

    fn lease_count(&self) -> usize {
        self.leases.load(Ordering::Relaxed)
    }

    fn is_tag(&self, tag: &str) -> bool {
        string_list_contains(&self.tags.lock(), tag)
    }
}

/// Pins one listen-stream entry; the child process stays available
/// while at least one lease is held.
pub struct ListenStreamLease {
    entry: Arc<EntryShared>,
}

impl ListenStreamLease {
    /// The sticky error of a faded entry, if startup failed.
    pub fn error(&self) -> Option<ListenStreamError> {
        self.entry.error.lock().clone()
    }

    pub fn is_faded(&self) -> bool {
        self.entry.is_faded()
    }
}

impl Drop for ListenStreamLease {
    fn drop(&mut self) {
        self.entry.leases.fetch_sub(1, Ordering::Relaxed);
        self.entry.changed.notify_waiters();
    }
}

pub struct ListenStreamStock {
    handler: Arc<dyn ListenStreamHandler>,
    items: Mutex<HashMap<String, Arc<EntryShared>>>,
}

impl ListenStreamStock {
    pub fn new(handler: Arc<dyn ListenStreamHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            items: Mutex::new(HashMap::new()),
        })
    }

    /// Create (or reuse) the listener for the given key.  The key is
    /// the container path, optionally followed by `NUL tag`; only the
    /// last path component names the socket file.
    ///
    /// Returns the real socket path and a lease pinning the entry.
    pub fn get(
        self: &Arc<Self>,
        key: &str,
    ) -> Result<(PathBuf, ListenStreamLease), ListenStreamError> {
        let mut items = self.items.lock();

        if let Some(entry) = items.get(key)
            && !entry.is_faded()
        {
            /* a sticky error poisons the entry for all takers */
            if let Some(error) = entry.error.lock().clone() {
                return Err(error);
            }

            entry.leases.fetch_add(1, Ordering::Relaxed);
            entry.changed.notify_waiters();
            return Ok((
                entry.path.clone(),
                ListenStreamLease {
                    entry: Arc::clone(entry),
                },
            ));
        }

        /* no usable entry; create one (a faded predecessor stays
           alive through its own leases until its driver retires
           it) */
        let (listener, fd) = TempListener::create(SockType::Stream, 16)?;
        let path = listener.path().to_owned();

        /* the bytes after the NUL in the key are the listener tags */
        let entry = Arc::new(EntryShared {
            key: key.to_owned(),
            path: path.clone(),
            tags: Mutex::new(split_key(key).1.to_owned()),
            fade: AtomicBool::new(false),
            error: Mutex::new(None),
            leases: AtomicUsize::new(1),
            changed: Notify::new(),
        });

        items.insert(key.to_owned(), Arc::clone(&entry));
        drop(items);

        debug!(key, path = %path.display(), "new listen-stream entry");

        let stock = Arc::downgrade(self);
        let handler = Arc::clone(&self.handler);
        let driver_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            drive_entry(stock, handler, driver_entry, listener, fd).await;
        });

        Ok((path, ListenStreamLease { entry }))
    }

    /// Replace a `mount_listen_stream` path with a bind-file mount of
    /// the real socket, appended to the end of the mount list.  The
    /// returned lease pins the listener.
    pub fn apply(
        self: &Arc<Self>,
        ns: &mut NamespaceOptions,
    ) -> Result<Option<ListenStreamLease>, ListenStreamError> {
        let Some(key) = ns.mount_listen_stream.take() else {
            return Ok(None);
        };

        let container_path = key.split('\0').next().unwrap_or("");
        if container_path.is_empty() {
            return Err(ListenStreamError::MalformedPath);
        }

        let (local_path, lease) = self.get(&key)?;

        let source = local_path
            .to_str()
            .ok_or(ListenStreamError::MalformedPath)?
            .trim_start_matches('/');
        ns.mounts.push(Mount::bind_file(source, container_path));

        Ok(Some(lease))
    }

    pub fn fade_all(&self) {
        for entry in self.items.lock().values() {
            entry.fade();
        }
    }

    /// Fade entries by *listener* tag (the bytes after the NUL in the
    /// key); a distinct namespace from child-process tags.
    pub fn fade_tag(&self, tag: &str) {
        for entry in self.items.lock().values() {
            if entry.is_tag(tag) {
                entry.fade();
            }
        }
    }

    fn retire(&self, entry: &Arc<EntryShared>) {
        let mut items = self.items.lock();
        if let Some(current) = items.get(&entry.key)
            && Arc::ptr_eq(current, entry)
        {
            items.remove(&entry.key);
        }
    }
}

/// The per-entry state machine: Listening -> Querying -> Running ->
/// Cooling -> back to Listening, or Faded on error.
async fn drive_entry(
    stock: Weak<ListenStreamStock>,
    handler: Arc<dyn ListenStreamHandler>,
    entry: Arc<EntryShared>,
    listener: TempListener,
    fd: OwnedFd,
) {
    let listener_fd = match AsyncFd::with_interest(fd, Interest::READABLE) {
        Ok(fd) => fd,
        Err(e) => {
            *entry.error.lock() = Some(ListenStreamError::Io(Arc::new(e)));
            entry.fade();
            wait_abandoned(&entry).await;
            if let Some(stock) = stock.upgrade() {
                stock.retire(&entry);
            }
            return;
        }
    };

    /* the TempListener removes the socket file when dropped at the
       end of this task */
    let _listener = listener;

    loop {
        if entry.is_faded() {
            break;
        }

        /* Listening (or Idle when no lease is held) */
        let accepted = tokio::select! {
            () = entry.changed.notified() => continue,
            () = idle_expiry(&entry) => break,
            r = listener_fd.ready(Interest::READABLE) => r.is_ok(),
        };

        if !accepted {
            break;
        }

        /* Querying: at most one handler call in flight */
        let socket = match listener_fd.get_ref().try_clone() {
            Ok(socket) => socket,
            Err(e) => {
                *entry.error.lock() = Some(ListenStreamError::Io(Arc::new(e)));
                entry.fade();
                break;
            }
        };

        let result = handler
            .ready(entry.key.clone(), entry.path.clone(), socket)
            .await;

        let server = match result {
            Ok(server) => server,
            Err(e) => {
                warn!(key = %entry.key, "listen-stream startup failed: {e}");
                *entry.error.lock() = Some(e);
                entry.fade();
                break;
            }
        };

        if !server.tags.is_empty() {
            let mut tags = entry.tags.lock();
            if tags.is_empty() {
                *tags = server.tags;
            } else {
                tags.push('\0');
                tags.push_str(&server.tags);
            }
        }

        /* Running: hold the child handle; dropping it kills the
           process */
        let handle = server.handle;
        let mut exit = handle.exit_listener();

        tokio::select! {
            status = exit.wait() => {
                debug!(key = %entry.key, status, "listen-stream server exited");
                drop(handle);
            }
            () = wait_faded_abandoned(&entry) => {
                /* nobody needs this process anymore; terminate it */
                drop(handle);
                break;
            }
        }

        if entry.lease_count() == 0 {
            entry.fade();
            break;
        }

        /* Cooling: back off to avoid a busy loop with a child that
           fails repeatedly; abandonment or a fade during the backoff
           retires the entry right away */
        tokio::select! {
            () = tokio::time::sleep(COOLING_INTERVAL) => {}
            () = wait_cooling_interrupted(&entry) => {
                entry.fade();
                break;
            }
        }
    }

    wait_abandoned(&entry).await;

    if let Some(stock) = stock.upgrade() {
        stock.retire(&entry);
    }
    debug!(key = %entry.key, "listen-stream entry destroyed");
}

/// Resolves when the entry has been idle (no leases) for the idle
/// TTL.
async fn idle_expiry(entry: &EntryShared) {
    loop {
        /* register the waiter before checking the condition, so a
           notification cannot slip in between */
        let changed = entry.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        if entry.lease_count() > 0 {
            /* not idle; sleep until something changes */
            changed.await;
            continue;
        }

        tokio::select! {
            () = &mut changed => continue,
            () = tokio::time::sleep(IDLE_TIMEOUT) => return,
        }
    }
}

/// Wait until the last lease is dropped.
async fn wait_abandoned(entry: &EntryShared) {
    loop {
        let changed = entry.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        if entry.lease_count() == 0 {
            return;
        }
        changed.await;
    }
}

/// Wait until the entry is faded and the last lease is dropped.
async fn wait_faded_abandoned(entry: &EntryShared) {
    loop {
        let changed = entry.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        if entry.is_faded() && entry.lease_count() == 0 {
            return;
        }
        changed.await;
    }
}

/// Aborts the cooling backoff: resolves as soon as nobody holds a
/// lease anymore, or the entry is faded.  Either way the backed-off
/// restart will never be useful.
async fn wait_cooling_interrupted(entry: &EntryShared) {
    loop {
        let changed = entry.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        if entry.lease_count() == 0 || entry.is_faded() {
            return;
        }
        changed.await;
    }
}

/// Split a listen-stream key into its path and tag parts.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('\0') {
        Some((path, tag)) => (path, tag),
        None => (key, ""),
    }
}

/// The socket name the child sees: the last component of the
/// container path.
pub fn socket_name(container_path: &str) -> &str {
    Path::new(container_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(container_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_with_tag() {
        assert_eq!(split_key("/run/app.sock\0v1"), ("/run/app.sock", "v1"));
        assert_eq!(split_key("/run/app.sock"), ("/run/app.sock", ""));
    }

    #[test]
    fn socket_name_is_last_component() {
        assert_eq!(socket_name("/run/app/control.sock"), "control.sock");
    }
}
