//! Wiring a freshly spawned WAS child: control socket plus the two
//! body pipes.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::unistd::pipe;

use super::idle::WasSocket;
use crate::listen_stream::{ListenStreamError, ListenStreamLease, ListenStreamStock};
use crate::spawn::{ChildHandle, ChildOptions, PreparedChildProcess, SpawnClient, SpawnError};

/// The result of launching one WAS child.
pub struct WasLaunch {
    pub socket: WasSocket,
    pub handle: ChildHandle,
    pub listen_stream_lease: Option<ListenStreamLease>,
}

#[derive(Debug, thiserror::Error)]
pub enum WasLaunchError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    ListenStream(#[from] ListenStreamError),

    #[error("failed to set up WAS channels: {0}")]
    Io(#[from] std::io::Error),
}

/// Create the parent/child halves of the WAS channel triple.
/// Returns `(parent, child)` where the child half is
/// `(control, stdin, stdout)`.
pub fn create_was_channels() -> std::io::Result<(WasSocket, (OwnedFd, OwnedFd, OwnedFd))> {
    let (control_parent, control_child) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(std::io::Error::from)?;

    /* request body: parent writes, child reads on stdin */
    let (request_read, request_write) = pipe().map_err(std::io::Error::from)?;

    /* response body: child writes on stdout, parent reads */
    let (response_read, response_write) = pipe().map_err(std::io::Error::from)?;

    Ok((
        WasSocket {
            control: control_parent,
            input: response_read,
            output: request_write,
        },
        (control_child, request_read, response_write),
    ))
}

/// Spawn one WAS child process.
pub async fn was_launch(
    spawn: &Arc<SpawnClient>,
    listen_stream: Option<&Arc<ListenStreamStock>>,
    name: &str,
    executable_path: &str,
    args: &[String],
    options: &ChildOptions,
) -> Result<WasLaunch, WasLaunchError> {
    let mut p = PreparedChildProcess::default();
    p.append(executable_path);
    for i in args {
        p.append(i);
    }

    options.copy_to(&mut p)?;

    let listen_stream_lease = match listen_stream {
        Some(stock) => stock.apply(&mut p.ns)?,
        None => {
            p.ns.mount_listen_stream = None;
            None
        }
    };

    let (socket, (control_child, stdin_child, stdout_child)) = create_was_channels()?;
    p.control = Some(control_child);
    p.stdin = Some(stdin_child);
    p.stdout = Some(stdout_child);

    let handle = spawn.spawn_child(name, p).await?;

    Ok(WasLaunch {
        socket,
        handle,
        listen_stream_lease,
    })
}
