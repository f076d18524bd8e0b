//! Framing of the WAS control channel.
//!
//! Control packets are fixed headers (command + payload length)
//! followed by the payload, exchanged over an `AF_LOCAL` socket next
//! to the request/response data pipes.

use thiserror::Error;

/// Size of the packet header on the wire.
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WasCommand {
    Nop = 0,
    Request = 1,
    Method = 2,
    Uri = 3,
    ScriptName = 4,
    PathInfo = 5,
    QueryString = 6,
    Header = 7,
    Parameter = 8,
    Status = 9,
    NoData = 10,
    Data = 11,
    Length = 12,
    Stop = 13,
    Premature = 14,
    RemoteHost = 15,
    Metric = 16,
}

impl TryFrom<u16> for WasCommand {
    type Error = WasProtocolError;

    fn try_from(value: u16) -> Result<Self, WasProtocolError> {
        Ok(match value {
            0 => Self::Nop,
            1 => Self::Request,
            2 => Self::Method,
            3 => Self::Uri,
            4 => Self::ScriptName,
            5 => Self::PathInfo,
            6 => Self::QueryString,
            7 => Self::Header,
            8 => Self::Parameter,
            9 => Self::Status,
            10 => Self::NoData,
            11 => Self::Data,
            12 => Self::Length,
            13 => Self::Stop,
            14 => Self::Premature,
            15 => Self::RemoteHost,
            16 => Self::Metric,
            _ => return Err(WasProtocolError::UnknownCommand(value)),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WasProtocolError {
    #[error("unknown WAS control command {0}")]
    UnknownCommand(u16),

    #[error("malformed WAS control packet")]
    Malformed,

    #[error("unexpected data from idle WAS control connection")]
    UnexpectedData,

    #[error("WAS control socket closed unexpectedly")]
    Closed,

    #[error("missing PREMATURE payload")]
    MissingPremature,

    #[error("bogus PREMATURE payload")]
    BogusPremature,
}

/// One parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WasHeader {
    pub length: u16,
    pub command: u16,
}

impl WasHeader {
    pub fn parse(raw: [u8; HEADER_SIZE]) -> Self {
        Self {
            length: u16::from_le_bytes([raw[0], raw[1]]),
            command: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let l = self.length.to_le_bytes();
        let c = self.command.to_le_bytes();
        [l[0], l[1], c[0], c[1]]
    }
}

/// Encode one packet (header plus payload).
pub fn encode_packet(command: WasCommand, payload: &[u8]) -> Vec<u8> {
    let header = WasHeader {
        length: payload.len() as u16,
        command: command as u16,
    };

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.encode());
    buffer.extend_from_slice(payload);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = WasHeader {
            length: 8,
            command: WasCommand::Premature as u16,
        };
        assert_eq!(WasHeader::parse(h.encode()), h);
    }

    #[test]
    fn premature_packet_layout() {
        let packet = encode_packet(WasCommand::Premature, &1024u64.to_le_bytes());
        assert_eq!(packet.len(), HEADER_SIZE + 8);

        let header = WasHeader::parse(packet[..HEADER_SIZE].try_into().expect("header"));
        assert_eq!(header.length, 8);
        assert_eq!(WasCommand::try_from(header.command), Ok(WasCommand::Premature));
        assert_eq!(
            u64::from_le_bytes(packet[HEADER_SIZE..].try_into().expect("payload")),
            1024
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert_eq!(
            WasCommand::try_from(999),
            Err(WasProtocolError::UnknownCommand(999))
        );
    }
}
