//! The client side of the Multi-WAS protocol: many logical request
//! streams multiplexed over one long-lived `SOCK_SEQPACKET` socket.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::sys::socket::MsgFlags;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::idle::WasSocket;
use super::launch::create_was_channels;
use crate::spawn::protocol::{receive_message, send_message};

/// Command byte asking the peer to accept one new stream; the three
/// channel descriptors ride in the ancillary data.
const NEW_CONNECTION: u8 = 0x01;

/// One multiplexed WAS peer (a spawned child or a remote server).
pub struct MultiClient {
    socket: AsyncFd<OwnedFd>,
}

impl MultiClient {
    /// Must be called inside a tokio runtime.
    pub fn new(socket: OwnedFd) -> std::io::Result<Self> {
        Ok(Self {
            socket: AsyncFd::new(socket)?,
        })
    }

    /// Open a new logical stream: create a fresh channel triple and
    /// hand the peer halves over the multiplexer socket.
    pub async fn connect(&self) -> std::io::Result<WasSocket> {
        let (parent, (control, stdin, stdout)) = create_was_channels()?;

        let payload = [NEW_CONNECTION];
        let fds = [control, stdin, stdout];

        loop {
            let mut guard = self.socket.ready(Interest::WRITABLE).await?;

            match send_message(self.socket.get_ref().as_fd(), &payload, &fds) {
                Ok(()) => break,
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready_matching(tokio::io::Ready::WRITABLE);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(parent)
    }

    /// Resolves when the peer has hung up or violated the protocol
    /// (the multiplexer never sends unsolicited datagrams).
    pub async fn wait_disconnect(&self) {
        loop {
            let Ok(mut guard) = self.socket.ready(Interest::READABLE).await else {
                return;
            };

            let mut buffer = [0u8; 16];
            match receive_message(
                self.socket.get_ref().as_fd(),
                &mut buffer,
                MsgFlags::MSG_DONTWAIT,
            ) {
                Ok((0, _)) => return,
                Ok(_) => return,
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready_matching(tokio::io::Ready::READABLE);
                }
                Err(_) => return,
            }
        }
    }

    pub fn as_raw_fd(&self) -> i32 {
        self.socket.get_ref().as_raw_fd()
    }
}
