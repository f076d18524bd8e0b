//! Shared state for child processes managed by the process-pool
//! stocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::socket::SockType;
use parking_lot::Mutex;
use tracing::debug;

use super::client::{ChildHandle, ExitListener};
use crate::listen_stream::ListenStreamLease;
use crate::net::TempListener;
use crate::string_list::string_list_contains;

/// The part of a stock item common to all child-process variants: the
/// spawner handle, the tag list and the fade flag.
pub struct ChildProcess {
    /// NUL-separated tag list for bulk fade.
    tag: String,

    faded: AtomicBool,

    handle: Mutex<Option<ChildHandle>>,

    exit: ExitListener,

    /// Keeps the listen-stream entry (and thus its socket) alive
    /// while this child runs.
    _listen_stream_lease: Option<ListenStreamLease>,
}

impl ChildProcess {
    pub fn new(
        tag: &str,
        handle: ChildHandle,
        listen_stream_lease: Option<ListenStreamLease>,
    ) -> Self {
        let exit = handle.exit_listener();
        Self {
            tag: tag.to_owned(),
            faded: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
            exit,
            _listen_stream_lease: listen_stream_lease,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_tag(&self, tag: &str) -> bool {
        string_list_contains(&self.tag, tag)
    }

    pub fn fade(&self) {
        self.faded.store(true, Ordering::Relaxed);
    }

    pub fn is_faded(&self) -> bool {
        self.faded.load(Ordering::Relaxed)
    }

    /// Has the child already exited?  An exited child must not be
    /// reused.
    pub fn has_exited(&self) -> bool {
        self.exit.exit_status().is_some()
    }

    /// Resolves when the child exits.
    pub async fn wait_exit(&self) -> i32 {
        self.exit.clone().wait().await
    }

    pub fn exit_listener(&self) -> ExitListener {
        self.exit.clone()
    }

    /// Terminate the child (used on destroy).
    pub fn kill(&self) {
        if let Some(mut handle) = self.handle.lock().take() {
            if handle.exit_status().is_none() {
                debug!(id = handle.id(), name = handle.name(), "terminating child process");
                handle.kill(libc::SIGTERM);
            }
        }
    }
}

/// A listening socket created for a "listen" child: the child
/// inherits the listener, the pool dials a fresh connection per
/// request.
pub struct ChildSocket {
    listener: TempListener,
}

impl ChildSocket {
    /// Create the listener; the returned fd becomes the child's
    /// stdin.
    pub fn create(
        socket_type: SockType,
        backlog: i32,
    ) -> std::io::Result<(Self, std::os::fd::OwnedFd)> {
        let (listener, fd) = TempListener::create(socket_type, backlog)?;
        Ok((Self { listener }, fd))
    }

    /// Connect to the child.  A failure here fades the child: if the
    /// connection fails once, it will never work.
    pub async fn connect(
        &self,
        process: &Arc<ChildProcess>,
    ) -> std::io::Result<tokio::net::UnixStream> {
        match self.listener.connect().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                process.fade();
                Err(e)
            }
        }
    }
}
