//! Temporary listener sockets handed to child processes.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use nix::sys::socket::{AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, listen, socket};

/// A listening `AF_LOCAL` socket on a temporary path.  The file is
/// removed together with its directory when the value is dropped.
pub struct TempListener {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl TempListener {
    /// Create the socket and return the listening file descriptor,
    /// ready to be inherited by a child process.
    pub fn create(socket_type: SockType, backlog: i32) -> std::io::Result<(Self, OwnedFd)> {
        let dir = tempfile::Builder::new()
            .prefix("switchyard-socket-")
            .tempdir()?;
        let path = dir.path().join("socket");

        let fd = socket(
            AddressFamily::Unix,
            socket_type,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(std::io::Error::from)?;

        let addr = UnixAddr::new(&path).map_err(std::io::Error::from)?;
        bind(fd.as_raw_fd(), &addr).map_err(std::io::Error::from)?;
        listen(&fd, Backlog::new(backlog).unwrap_or(Backlog::MAXCONN))
            .map_err(std::io::Error::from)?;

        /* the path must be reachable for the container the peer runs
           in */
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;

        Ok((Self { _dir: dir, path }, fd))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connect a fresh stream to the listener.
    pub async fn connect(&self) -> std::io::Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::connect(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_connect() {
        let (listener, fd) = TempListener::create(SockType::Stream, 4).expect("create");
        assert!(listener.path().exists());

        let _client = listener.connect().await.expect("connect");
        drop(fd);
    }
}
