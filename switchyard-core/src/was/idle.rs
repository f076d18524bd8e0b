//! The idle-connection watchdog for WAS children.
//!
//! Every idle WAS connection is monitored: any unsolicited byte on
//! the control channel is fatal, and after the client sent `STOP`
//! mid-response, the watchdog performs the `PREMATURE` recovery
//! protocol before the connection may be reused.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nix::sys::socket::MsgFlags;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use super::control::{HEADER_SIZE, WasCommand, WasHeader, WasProtocolError};

/// The socket/pipe triple connecting one WAS request stream.
pub struct WasSocket {
    /// The control channel.
    pub control: OwnedFd,

    /// Response body pipe (read side).
    pub input: OwnedFd,

    /// Request body pipe (write side).
    pub output: OwnedFd,
}

enum Receive {
    Success,
    Again,
}

/// Manages a WAS connection which does not currently handle a
/// request.  It may be in the process of "stopping", waiting for the
/// peer's `PREMATURE` confirmation.
pub struct WasIdleConnection {
    control: AsyncFd<OwnedFd>,
    input: AsyncFd<OwnedFd>,
    output: OwnedFd,

    /// If true, we are waiting for `PREMATURE` (after the client sent
    /// `STOP`).
    stopping: AtomicBool,

    /// The number of body bytes received before `STOP` was sent.
    input_received: AtomicU64,
}

impl WasIdleConnection {
    /// Must be called inside a tokio runtime.  All descriptors are
    /// switched to non-blocking mode.
    pub fn new(socket: WasSocket) -> std::io::Result<Self> {
        set_nonblocking(&socket.control)?;
        set_nonblocking(&socket.input)?;
        set_nonblocking(&socket.output)?;

        Ok(Self {
            control: AsyncFd::new(socket.control)?,
            input: AsyncFd::new(socket.input)?,
            output: socket.output,
            stopping: AtomicBool::new(false),
            input_received: AtomicU64::new(0),
        })
    }

    pub fn control_fd(&self) -> &OwnedFd {
        self.control.get_ref()
    }

    pub fn input_fd(&self) -> &OwnedFd {
        self.input.get_ref()
    }

    pub fn output_fd(&self) -> &OwnedFd {
        &self.output
    }

    /// Record that the client sent `STOP` after having consumed
    /// `received` body bytes; the next idle period must recover the
    /// `PREMATURE` confirmation before the connection is clean.
    pub fn stop(&self, received: u64) {
        debug_assert!(!self.is_stopping());

        self.input_received.store(received, Ordering::Relaxed);
        self.stopping.store(true, Ordering::Relaxed);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// May this connection carry a new request right now?  A
    /// connection still recovering from `STOP` may not.
    pub fn may_borrow(&self) -> bool {
        !self.is_stopping()
    }

    /// Watch the idle connection; resolves with the reason once the
    /// connection has become unusable.  A successful `PREMATURE`
    /// recovery does not resolve - the connection returns to clean
    /// idle and the watch continues.
    pub async fn wait_broken(&self) -> WasProtocolError {
        loop {
            let mut guard = match self.control.ready(Interest::READABLE).await {
                Ok(guard) => guard,
                Err(_) => return WasProtocolError::Closed,
            };

            let result = if self.is_stopping() {
                self.recover_stop().await
            } else {
                self.check_unsolicited()
            };

            match result {
                /* saw EAGAIN: wait for the next readiness edge */
                Ok(true) => {
                    guard.clear_ready_matching(tokio::io::Ready::READABLE);
                }
                /* made progress; poll again before suspending */
                Ok(false) => {}
                Err(e) => return e,
            }
        }
    }

    /// The non-stopping case: any readable byte is fatal.
    fn check_unsolicited(&self) -> Result<bool, WasProtocolError> {
        let mut buffer = [0u8; 1];
        match nix::sys::socket::recv(
            self.control.get_ref().as_raw_fd(),
            &mut buffer,
            MsgFlags::MSG_DONTWAIT,
        ) {
            Err(nix::errno::Errno::EAGAIN) => Ok(true),
            Err(_) => Err(WasProtocolError::Closed),
            Ok(0) => Err(WasProtocolError::Closed),
            Ok(_) => Err(WasProtocolError::UnexpectedData),
        }
    }

    fn receive_control(&self, buffer: &mut [u8]) -> Result<Receive, WasProtocolError> {
        match nix::sys::socket::recv(
            self.control.get_ref().as_raw_fd(),
            buffer,
            MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(n) if n == buffer.len() => Ok(Receive::Success),
            Err(nix::errno::Errno::EAGAIN) => {
                /* the WAS application didn't send enough data (yet);
                   don't bother waiting for more */
                Ok(Receive::Again)
            }
            Err(_) => Err(WasProtocolError::Closed),
            Ok(0) => Err(WasProtocolError::Closed),
            Ok(_) => Err(WasProtocolError::UnexpectedData),
        }
    }

    fn discard_control(&self, mut size: usize) -> Result<(), WasProtocolError> {
        let mut buffer = [0u8; 1024];
        while size > 0 {
            let n = std::cmp::min(size, buffer.len());
            match nix::sys::socket::recv(
                self.control.get_ref().as_raw_fd(),
                &mut buffer[..n],
                MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(0) | Err(_) => return Err(WasProtocolError::Closed),
                Ok(n) => size -= n,
            }
        }
        Ok(())
    }

    /// Drain exactly `remaining` bytes of residual response body from
    /// the data pipe.
    async fn discard_input(&self, mut remaining: u64) -> Result<(), WasProtocolError> {
        let mut buffer = [0u8; 16384];
        while remaining > 0 {
            let size = std::cmp::min(remaining, buffer.len() as u64) as usize;
            match nix::unistd::read(self.input.get_ref().as_raw_fd(), &mut buffer[..size]) {
                Ok(0) => return Err(WasProtocolError::Closed),
                Ok(n) => remaining -= n as u64,
                Err(nix::errno::Errno::EAGAIN) => {
                    let mut guard = self
                        .input
                        .ready(Interest::READABLE)
                        .await
                        .map_err(|_| WasProtocolError::Closed)?;
                    guard.clear_ready_matching(tokio::io::Ready::READABLE);
                }
                Err(_) => return Err(WasProtocolError::Closed),
            }
        }
        Ok(())
    }

    /// Recover after the client sent `STOP`: skip benign packets
    /// until `PREMATURE`, validate its byte count and drain the
    /// difference from the data pipe.
    async fn recover_stop(&self) -> Result<bool, WasProtocolError> {
        let premature;

        loop {
            let mut raw = [0u8; HEADER_SIZE];
            match self.receive_control(&mut raw)? {
                Receive::Success => {}
                /* wait for more data */
                Receive::Again => return Ok(true),
            }

            let header = WasHeader::parse(raw);
            match WasCommand::try_from(header.command)? {
                WasCommand::Nop => continue,

                WasCommand::Header
                | WasCommand::Status
                | WasCommand::NoData
                | WasCommand::Data
                | WasCommand::Length
                | WasCommand::Stop
                | WasCommand::Metric => {
                    /* discard & ignore */
                    self.discard_control(usize::from(header.length))?;
                    continue;
                }

                WasCommand::Request
                | WasCommand::Method
                | WasCommand::Uri
                | WasCommand::ScriptName
                | WasCommand::PathInfo
                | WasCommand::QueryString
                | WasCommand::Parameter
                | WasCommand::RemoteHost => return Err(WasProtocolError::UnexpectedData),

                WasCommand::Premature => {
                    /* this is what we're waiting for */
                    let mut payload = [0u8; 8];
                    match self.receive_control(&mut payload)? {
                        Receive::Success => {}
                        Receive::Again => return Err(WasProtocolError::MissingPremature),
                    }

                    premature = u64::from_le_bytes(payload);
                    break;
                }
            }
        }

        let input_received = self.input_received.load(Ordering::Relaxed);
        if premature < input_received {
            return Err(WasProtocolError::BogusPremature);
        }

        self.discard_input(premature - input_received).await?;

        self.stopping.store(false, Ordering::Relaxed);
        debug!("WAS connection recovered from STOP");
        Ok(false)
    }
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};

    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    fcntl(
        fd.as_raw_fd(),
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )
    .map_err(std::io::Error::from)?;
    Ok(())
}

impl AsFd for WasIdleConnection {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.control.get_ref().as_fd()
    }
}
