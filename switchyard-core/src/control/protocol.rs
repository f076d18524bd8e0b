//! The control-plane wire protocol.
//!
//! Clients send datagrams with the same record framing as the
//! translation protocol (`length:u16 command:u16 payload…`, 4-byte
//! padded).

use thiserror::Error;

pub use crate::translation::invalidate::{is_padded, padded_length};

/// Size of the record header on the wire.
pub const HEADER_SIZE: usize = 4;

/// The default control socket, in the abstract namespace.
pub const DEFAULT_SOCKET: &str = "@bp-control";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlCommand {
    /// Liveness check, no payload.
    Nop = 0,

    /// Keyed translation-cache invalidation.
    TcacheInvalidate = 1,

    DumpPools = 2,

    EnableNode = 3,
    FadeNode = 4,
    NodeStatus = 5,

    Stats = 6,

    /// Adjust the log level; payload is one byte.
    Verbose = 7,

    /// Fade child processes, optionally filtered by tag.
    FadeChildren = 8,

    DisableZeroconf = 9,
    EnableZeroconf = 10,

    FlushNfsCache = 11,

    FlushFilterCache = 12,

    /// Request a profiling pipe; the response carries one ancillary
    /// fd.
    StopwatchPipe = 13,

    DiscardSession = 14,
}

impl TryFrom<u16> for ControlCommand {
    type Error = ControlError;

    fn try_from(value: u16) -> Result<Self, ControlError> {
        Ok(match value {
            0 => Self::Nop,
            1 => Self::TcacheInvalidate,
            2 => Self::DumpPools,
            3 => Self::EnableNode,
            4 => Self::FadeNode,
            5 => Self::NodeStatus,
            6 => Self::Stats,
            7 => Self::Verbose,
            8 => Self::FadeChildren,
            9 => Self::DisableZeroconf,
            10 => Self::EnableZeroconf,
            11 => Self::FlushNfsCache,
            12 => Self::FlushFilterCache,
            13 => Self::StopwatchPipe,
            14 => Self::DiscardSession,
            _ => return Err(ControlError::UnknownCommand(value)),
        })
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown control command {0}")]
    UnknownCommand(u16),

    #[error("malformed control packet")]
    Malformed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The fixed counter block answering a `STATS` request.  All fields
/// are big-endian on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlStats {
    /// Number of open incoming connections.
    pub incoming_connections: u32,

    /// Number of open outgoing connections.
    pub outgoing_connections: u32,

    /// Number of child processes.
    pub children: u32,

    /// Number of sessions.
    pub sessions: u32,

    /// Total number of incoming HTTP requests handled so far.
    pub http_requests: u64,

    pub translation_cache_size: u64,
    pub http_cache_size: u64,
    pub filter_cache_size: u64,

    pub io_buffers_size: u64,
}

impl ControlStats {
    pub const WIRE_SIZE: usize = 56;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buffer = [0u8; Self::WIRE_SIZE];
        buffer[0..4].copy_from_slice(&self.incoming_connections.to_be_bytes());
        buffer[4..8].copy_from_slice(&self.outgoing_connections.to_be_bytes());
        buffer[8..12].copy_from_slice(&self.children.to_be_bytes());
        buffer[12..16].copy_from_slice(&self.sessions.to_be_bytes());
        buffer[16..24].copy_from_slice(&self.http_requests.to_be_bytes());
        buffer[24..32].copy_from_slice(&self.translation_cache_size.to_be_bytes());
        buffer[32..40].copy_from_slice(&self.http_cache_size.to_be_bytes());
        buffer[40..48].copy_from_slice(&self.filter_cache_size.to_be_bytes());
        buffer[48..56].copy_from_slice(&self.io_buffers_size.to_be_bytes());
        buffer
    }

    pub fn parse(raw: &[u8]) -> Self {
        let mut buffer = [0u8; Self::WIRE_SIZE];
        let n = std::cmp::min(raw.len(), Self::WIRE_SIZE);
        buffer[..n].copy_from_slice(&raw[..n]);

        let u32_at = |i: usize| u32::from_be_bytes(buffer[i..i + 4].try_into().expect("4 bytes"));
        let u64_at = |i: usize| u64::from_be_bytes(buffer[i..i + 8].try_into().expect("8 bytes"));

        Self {
            incoming_connections: u32_at(0),
            outgoing_connections: u32_at(4),
            children: u32_at(8),
            sessions: u32_at(12),
            http_requests: u64_at(16),
            translation_cache_size: u64_at(24),
            http_cache_size: u64_at(32),
            filter_cache_size: u64_at(40),
            io_buffers_size: u64_at(48),
        }
    }
}

/// Encode one control datagram.
pub fn encode_packet(command: ControlCommand, payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(HEADER_SIZE + padded_length(payload.len()));
    buffer.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buffer.extend_from_slice(&(command as u16).to_le_bytes());
    buffer.extend_from_slice(payload);
    buffer.resize(HEADER_SIZE + padded_length(payload.len()), 0);
    buffer
}

/// Parse one control datagram into `(command, payload)`.
pub fn parse_packet(datagram: &[u8]) -> Result<(u16, &[u8]), ControlError> {
    if datagram.len() < HEADER_SIZE {
        return Err(ControlError::Malformed);
    }

    let length = usize::from(u16::from_le_bytes([datagram[0], datagram[1]]));
    let command = u16::from_le_bytes([datagram[2], datagram[3]]);

    if datagram.len() < HEADER_SIZE + length {
        return Err(ControlError::Malformed);
    }

    Ok((command, &datagram[HEADER_SIZE..HEADER_SIZE + length]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let wire = encode_packet(ControlCommand::Verbose, &[5]);
        assert_eq!(wire.len() % 4, 0);

        let (command, payload) = parse_packet(&wire).expect("parse");
        assert_eq!(ControlCommand::try_from(command).expect("command"), ControlCommand::Verbose);
        assert_eq!(payload, [5]);
    }

    #[test]
    fn stats_round_trip() {
        let stats = ControlStats {
            incoming_connections: 3,
            children: 17,
            http_requests: 123_456,
            ..Default::default()
        };

        let parsed = ControlStats::parse(&stats.encode());
        assert_eq!(parsed, stats);
    }

    #[test]
    fn truncated_packet_is_malformed() {
        assert!(parse_packet(&[1, 0, 0]).is_err());
        assert!(parse_packet(&[10, 0, 0, 0, 1, 2]).is_err());
    }
}
