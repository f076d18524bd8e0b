//! The translation wire protocol: length-prefixed typed records on a
//! stream socket.
//!
//! Each record is `length:u16` little-endian, `command:u16`
//! little-endian, followed by `length` payload bytes.  A request
//! begins with `BEGIN` and ends with `END`; the response is a record
//! stream terminated by `END` as well.

use thiserror::Error;

/// The protocol revision we speak.
pub const PROTOCOL_VERSION: u8 = 3;

/// Size of the record header on the wire.
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TranslationCommand {
    Begin = 1,
    End = 2,

    /* request descriptor */
    Host = 3,
    Uri = 4,
    Status = 5,
    Session = 6,
    Param = 7,
    User = 8,
    Language = 9,
    RemoteHost = 10,
    Site = 11,
    UserAgent = 12,
    QueryString = 13,
    ListenerTag = 14,
    LocalAddress = 15,
    LocalAddressString = 16,
    Authorization = 17,
    Args = 18,
    InternalRedirect = 19,
    Enotdir = 20,
    Want = 21,
    RealmSession = 22,
    WidgetType = 23,
    AltHost = 24,

    /* resource addresses */
    Path = 30,
    Http = 31,
    LhttpPath = 32,
    LhttpUri = 33,
    LhttpHost = 34,
    Cgi = 35,
    Fastcgi = 36,
    Was = 37,
    Pipe = 38,
    Address = 39,
    AddressString = 40,
    DocumentRoot = 41,
    ScriptName = 42,
    PathInfo = 43,
    Action = 44,
    Interpreter = 45,
    ContentType = 46,
    Deflated = 47,
    Gzipped = 48,

    /* base handling */
    Base = 50,
    EasyBase = 51,
    UnsafeBase = 52,
    AutoBase = 53,

    /* process execution */
    Execute = 60,
    AppendArg = 61,
    Pair = 62,
    Parameter = 63,
    ChildOptions = 64,
    Setenv = 65,
    StderrPath = 66,
    StderrNull = 67,
    Rlimits = 68,
    UserNamespace = 69,
    PidNamespace = 70,
    NetworkNamespace = 71,
    IpcNamespace = 72,
    MountNamespace = 73,
    MountProc = 74,
    PivotRoot = 75,
    MountHome = 76,
    Home = 77,
    MountTmpTmpfs = 78,
    MountTmpfs = 79,
    BindMount = 80,
    BindMountRw = 81,
    BindMountExec = 82,
    UtsNamespace = 83,
    CgroupName = 84,
    CgroupSet = 85,
    UidGid = 86,
    NoNewPrivs = 87,
    Refence = 88,
    ChildTag = 89,
    Priority = 90,
    Parallelism = 91,
    Concurrency = 92,
    Disposable = 93,
    RequestUriVerbatim = 94,
    MountListenStream = 95,
}

impl TranslationCommand {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::Begin,
            2 => Self::End,
            3 => Self::Host,
            4 => Self::Uri,
            5 => Self::Status,
            6 => Self::Session,
            7 => Self::Param,
            8 => Self::User,
            9 => Self::Language,
            10 => Self::RemoteHost,
            11 => Self::Site,
            12 => Self::UserAgent,
            13 => Self::QueryString,
            14 => Self::ListenerTag,
            15 => Self::LocalAddress,
            16 => Self::LocalAddressString,
            17 => Self::Authorization,
            18 => Self::Args,
            19 => Self::InternalRedirect,
            20 => Self::Enotdir,
            21 => Self::Want,
            22 => Self::RealmSession,
            23 => Self::WidgetType,
            24 => Self::AltHost,
            30 => Self::Path,
            31 => Self::Http,
            32 => Self::LhttpPath,
            33 => Self::LhttpUri,
            34 => Self::LhttpHost,
            35 => Self::Cgi,
            36 => Self::Fastcgi,
            37 => Self::Was,
            38 => Self::Pipe,
            39 => Self::Address,
            40 => Self::AddressString,
            41 => Self::DocumentRoot,
            42 => Self::ScriptName,
            43 => Self::PathInfo,
            44 => Self::Action,
            45 => Self::Interpreter,
            46 => Self::ContentType,
            47 => Self::Deflated,
            48 => Self::Gzipped,
            50 => Self::Base,
            51 => Self::EasyBase,
            52 => Self::UnsafeBase,
            53 => Self::AutoBase,
            60 => Self::Execute,
            61 => Self::AppendArg,
            62 => Self::Pair,
            63 => Self::Parameter,
            64 => Self::ChildOptions,
            65 => Self::Setenv,
            66 => Self::StderrPath,
            67 => Self::StderrNull,
            68 => Self::Rlimits,
            69 => Self::UserNamespace,
            70 => Self::PidNamespace,
            71 => Self::NetworkNamespace,
            72 => Self::IpcNamespace,
            73 => Self::MountNamespace,
            74 => Self::MountProc,
            75 => Self::PivotRoot,
            76 => Self::MountHome,
            77 => Self::Home,
            78 => Self::MountTmpTmpfs,
            79 => Self::MountTmpfs,
            80 => Self::BindMount,
            81 => Self::BindMountRw,
            82 => Self::BindMountExec,
            83 => Self::UtsNamespace,
            84 => Self::CgroupName,
            85 => Self::CgroupSet,
            86 => Self::UidGid,
            87 => Self::NoNewPrivs,
            88 => Self::Refence,
            89 => Self::ChildTag,
            90 => Self::Priority,
            91 => Self::Parallelism,
            92 => Self::Concurrency,
            93 => Self::Disposable,
            94 => Self::RequestUriVerbatim,
            95 => Self::MountListenStream,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum TranslationError {
    /// A record's declared length is impossible; fatal to the
    /// connection.
    #[error("malformed translation packet")]
    Malformed,

    #[error("translation payload for command {0:?} is invalid")]
    InvalidPayload(TranslationCommand),

    #[error("misplaced translation packet {0:?}")]
    Misplaced(TranslationCommand),

    #[error("translation response is incomplete")]
    Incomplete,

    #[error("translation server refused: status {0}")]
    Status(u16),

    #[error(transparent)]
    Address(#[from] crate::address::AddressError),

    #[error("translation I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationHeader {
    pub length: u16,
    pub command: u16,
}

impl TranslationHeader {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = TranslationHeader {
            length: 11,
            command: TranslationCommand::Uri as u16,
        };
        assert_eq!(TranslationHeader::parse(h.encode()), h);
    }

    #[test]
    fn command_mapping() {
        assert_eq!(TranslationCommand::from_u16(1), Some(TranslationCommand::Begin));
        assert_eq!(
            TranslationCommand::from_u16(TranslationCommand::Was as u16),
            Some(TranslationCommand::Was)
        );
        assert_eq!(TranslationCommand::from_u16(25), None);
        assert_eq!(TranslationCommand::from_u16(9999), None);
    }
}
