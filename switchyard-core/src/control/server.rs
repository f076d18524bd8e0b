//! The control-plane datagram server.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;

use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr, bind, recvfrom, sendto, socket,
};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use super::protocol::{ControlCommand, ControlError, ControlStats, encode_packet, parse_packet};
use crate::translation::invalidate::parse_invalidate;
use crate::translation::InvalidateRequest;

/// Implemented by the instance; every command the server understands
/// is dispatched here.
pub trait ControlHandler: Send + Sync + 'static {
    fn tcache_invalidate(&self, request: InvalidateRequest);

    fn verbose(&self, level: u8);

    fn enable_node(&self, name: &str);
    fn fade_node(&self, name: &str);

    /// Returns the status text for `NODE_STATUS`.
    fn node_status(&self, name: &str) -> Option<String>;

    fn fade_children(&self, tag: Option<&str>);

    fn flush_filter_cache(&self, tag: Option<&str>);

    fn discard_session(&self, attach_id: &[u8]);

    fn stats(&self) -> ControlStats;

    fn dump_pools(&self) -> String;

    fn disable_zeroconf(&self);
    fn enable_zeroconf(&self);

    fn flush_nfs_cache(&self);

    /// Returns the descriptor streamed back for `STOPWATCH_PIPE`.
    fn stopwatch_pipe(&self) -> Option<OwnedFd>;
}

/// Bind the control socket.  A leading `@` selects the abstract
/// namespace.
pub fn bind_control_socket(address: &str) -> std::io::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(std::io::Error::from)?;

    let addr = if let Some(name) = address.strip_prefix('@') {
        UnixAddr::new_abstract(name.as_bytes()).map_err(std::io::Error::from)?
    } else {
        let _ = std::fs::remove_file(address);
        UnixAddr::new(address).map_err(std::io::Error::from)?
    };

    bind(fd.as_raw_fd(), &addr).map_err(std::io::Error::from)?;
    Ok(fd)
}

/// Accepts control datagrams and dispatches them to the handler.
pub struct ControlServer {
    socket: AsyncFd<OwnedFd>,
    handler: Arc<dyn ControlHandler>,
}

impl ControlServer {
    pub fn new(socket: OwnedFd, handler: Arc<dyn ControlHandler>) -> std::io::Result<Self> {
        Ok(Self {
            socket: AsyncFd::new(socket)?,
            handler,
        })
    }

    /// Serve until the task is dropped.
    pub async fn run(self) {
        loop {
            let Ok(mut guard) = self.socket.ready(Interest::READABLE).await else {
                return;
            };

            let mut buffer = [0u8; 8192];
            match recvfrom::<UnixAddr>(self.socket.get_ref().as_raw_fd(), &mut buffer) {
                Ok((n, from)) => {
                    if let Err(e) = self.handle_datagram(&buffer[..n], from.as_ref()) {
                        warn!("control request failed: {e}");
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready_matching(tokio::io::Ready::READABLE);
                }
                Err(e) => {
                    warn!("control socket receive failed: {e}");
                    return;
                }
            }
        }
    }

    fn handle_datagram(
        &self,
        datagram: &[u8],
        from: Option<&UnixAddr>,
    ) -> Result<(), ControlError> {
        let (raw_command, payload) = parse_packet(datagram)?;
        let command = ControlCommand::try_from(raw_command)?;

        debug!(?command, "control request");

        match command {
            ControlCommand::Nop => {}

            ControlCommand::TcacheInvalidate => {
                let request =
                    parse_invalidate(payload).map_err(|_| ControlError::Malformed)?;
                self.handler.tcache_invalidate(request);
            }

            ControlCommand::Verbose => {
                let &[level] = payload else {
                    return Err(ControlError::Malformed);
                };
                self.handler.verbose(level);
            }

            ControlCommand::EnableNode => {
                self.handler.enable_node(payload_str(payload)?);
            }

            ControlCommand::FadeNode => {
                self.handler.fade_node(payload_str(payload)?);
            }

            ControlCommand::NodeStatus => {
                let name = payload_str(payload)?;
                let status = self.handler.node_status(name).unwrap_or_default();

                /* response is "name NUL status" */
                let mut response = Vec::with_capacity(name.len() + 1 + status.len());
                response.extend_from_slice(name.as_bytes());
                response.push(0);
                response.extend_from_slice(status.as_bytes());

                self.reply(from, ControlCommand::NodeStatus, &response)?;
            }

            ControlCommand::FadeChildren => {
                let tag = optional_payload_str(payload)?;
                self.handler.fade_children(tag);
            }

            ControlCommand::FlushFilterCache => {
                let tag = optional_payload_str(payload)?;
                self.handler.flush_filter_cache(tag);
            }

            ControlCommand::DiscardSession => {
                self.handler.discard_session(payload);
            }

            ControlCommand::Stats => {
                let stats = self.handler.stats();
                self.reply(from, ControlCommand::Stats, &stats.encode())?;
            }

            ControlCommand::DumpPools => {
                let dump = self.handler.dump_pools();
                tracing::info!("pool dump:\n{dump}");
            }

            ControlCommand::DisableZeroconf => self.handler.disable_zeroconf(),
            ControlCommand::EnableZeroconf => self.handler.enable_zeroconf(),

            ControlCommand::FlushNfsCache => self.handler.flush_nfs_cache(),

            ControlCommand::StopwatchPipe => {
                let Some(pipe) = self.handler.stopwatch_pipe() else {
                    return Err(ControlError::Malformed);
                };

                if let Some(from) = from {
                    let response = encode_packet(ControlCommand::StopwatchPipe, &[]);
                    let fds = [pipe];
                    crate::spawn::protocol::send_message_to(
                        self.socket.get_ref().as_fd(),
                        &response,
                        &fds,
                        from,
                    )
                    .map_err(std::io::Error::from)?;
                }
            }
        }

        Ok(())
    }

    fn reply(
        &self,
        to: Option<&UnixAddr>,
        command: ControlCommand,
        payload: &[u8],
    ) -> Result<(), ControlError> {
        let Some(to) = to else {
            /* the client did not bind; nowhere to send the reply */
            return Ok(());
        };

        let response = encode_packet(command, payload);
        sendto(
            self.socket.get_ref().as_raw_fd(),
            &response,
            to,
            MsgFlags::MSG_DONTWAIT,
        )
        .map_err(std::io::Error::from)?;
        Ok(())
    }
}

fn payload_str(payload: &[u8]) -> Result<&str, ControlError> {
    std::str::from_utf8(payload).map_err(|_| ControlError::Malformed)
}

fn optional_payload_str(payload: &[u8]) -> Result<Option<&str>, ControlError> {
    if payload.is_empty() {
        Ok(None)
    } else {
        payload_str(payload).map(Some)
    }
}
