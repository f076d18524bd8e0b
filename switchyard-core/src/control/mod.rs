//! The control plane: a datagram protocol for operating a running
//! instance (cache invalidation, fades, stats, log level).

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use protocol::{ControlCommand, ControlError, ControlStats, DEFAULT_SOCKET};
pub use server::{ControlHandler, ControlServer, bind_control_socket};
