//! A synchronous control-plane client, used by the `switchyardctl`
//! tool.

use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr, bind, connect, recv, send, socket,
};

use super::protocol::{ControlCommand, ControlError, encode_packet, parse_packet};

/// One connected control client.
pub struct ControlClient {
    socket: OwnedFd,
}

impl ControlClient {
    /// Connect to the server at `address` (a path, or `@name` for the
    /// abstract namespace).
    pub fn connect(address: &str) -> Result<Self, ControlError> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(std::io::Error::from)?;

        let addr = if let Some(name) = address.strip_prefix('@') {
            UnixAddr::new_abstract(name.as_bytes()).map_err(std::io::Error::from)?
        } else {
            UnixAddr::new(address).map_err(std::io::Error::from)?
        };

        connect(fd.as_raw_fd(), &addr).map_err(std::io::Error::from)?;

        Ok(Self { socket: fd })
    }

    /// Bind to an autogenerated abstract address so the server can
    /// send replies.  Required before request/response commands like
    /// `STATS`.
    pub fn auto_bind(&self) -> Result<(), ControlError> {
        let addr = UnixAddr::new_unnamed();
        bind(self.socket.as_raw_fd(), &addr).map_err(std::io::Error::from)?;
        Ok(())
    }

    pub fn send(&self, command: ControlCommand, payload: &[u8]) -> Result<(), ControlError> {
        let wire = encode_packet(command, payload);
        send(self.socket.as_raw_fd(), &wire, MsgFlags::empty())
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Receive one response datagram.
    pub fn receive(
        &self,
        timeout: Duration,
    ) -> Result<(ControlCommand, Vec<u8>), ControlError> {
        let tv = nix::sys::time::TimeVal::new(
            timeout.as_secs() as i64,
            i64::from(timeout.subsec_micros()),
        );
        nix::sys::socket::setsockopt(
            &self.socket,
            nix::sys::socket::sockopt::ReceiveTimeout,
            &tv,
        )
        .map_err(std::io::Error::from)?;

        let mut buffer = [0u8; 8192];
        let n = recv(self.socket.as_raw_fd(), &mut buffer, MsgFlags::empty())
            .map_err(std::io::Error::from)?;

        let (raw_command, payload) = parse_packet(&buffer[..n])?;
        Ok((ControlCommand::try_from(raw_command)?, payload.to_vec()))
    }
}
