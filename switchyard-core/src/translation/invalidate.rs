//! Parsing the control-plane `TCACHE_INVALIDATE` payload.
//!
//! The payload is a sequence of translation records, 4-byte padded,
//! naming the cache dimensions to invalidate.

use super::protocol::{HEADER_SIZE, TranslationCommand, TranslationError, TranslationHeader};

/// One keyed invalidation: the union of all `(command, value)` pairs
/// narrows which cache entries are flushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidateRequest {
    pub site: Option<String>,

    pub uri: Option<String>,
    pub param: Option<String>,
    pub listener_tag: Option<String>,
    pub remote_host: Option<String>,
    pub host: Option<String>,
    pub language: Option<String>,
    pub user_agent: Option<String>,
    pub query_string: Option<String>,
    pub user: Option<String>,

    pub session: bool,
    pub realm_session: bool,
    pub internal_redirect: bool,
    pub enotdir: bool,

    /// The commands seen, in order, for diagnostics and matching.
    pub commands: Vec<TranslationCommand>,
}

impl InvalidateRequest {
    fn apply(
        &mut self,
        command: TranslationCommand,
        payload: &str,
    ) -> Result<(), TranslationError> {
        use TranslationCommand as C;

        match command {
            C::Uri => self.uri = Some(payload.to_owned()),
            C::Param => self.param = Some(payload.to_owned()),
            C::ListenerTag => self.listener_tag = Some(payload.to_owned()),
            C::RemoteHost => self.remote_host = Some(payload.to_owned()),
            C::Host => self.host = Some(payload.to_owned()),
            C::Language => self.language = Some(payload.to_owned()),
            C::UserAgent => self.user_agent = Some(payload.to_owned()),
            C::QueryString => self.query_string = Some(payload.to_owned()),
            C::User => self.user = Some(payload.to_owned()),
            C::Session => self.session = true,
            C::RealmSession => self.realm_session = true,
            C::InternalRedirect => self.internal_redirect = true,
            C::Enotdir => self.enotdir = true,
            _ => return Err(TranslationError::Misplaced(command)),
        }

        self.commands.push(command);
        Ok(())
    }
}

/// Control datagram payloads are padded to 4-byte boundaries.
pub fn padded_length(length: usize) -> usize {
    (length + 3) & !3
}

pub fn is_padded(length: usize) -> bool {
    length % 4 == 0
}

/// Parse one `TCACHE_INVALIDATE` payload.
pub fn parse_invalidate(mut p: &[u8]) -> Result<InvalidateRequest, TranslationError> {
    if !is_padded(p.len()) {
        /* must be padded */
        return Err(TranslationError::Malformed);
    }

    let mut request = InvalidateRequest::default();

    while !p.is_empty() {
        if p.len() < HEADER_SIZE {
            return Err(TranslationError::Malformed);
        }

        let header =
            TranslationHeader::parse(p[..HEADER_SIZE].try_into().expect("header slice"));
        p = &p[HEADER_SIZE..];

        let payload_length = usize::from(header.length);
        if p.len() < payload_length {
            return Err(TranslationError::Malformed);
        }

        let payload = std::str::from_utf8(&p[..payload_length])
            .map_err(|_| TranslationError::Malformed)?
            .to_owned();

        let command =
            TranslationCommand::from_u16(header.command).ok_or(TranslationError::Malformed)?;

        if command == TranslationCommand::Site {
            request.site = Some(payload);
        } else {
            request.apply(command, &payload)?;
        }

        /* skip the padding */
        let skip = std::cmp::min(padded_length(payload_length), p.len());
        p = &p[skip..];
    }

    Ok(request)
}

/// Encode one `(command, value)` pair the way `parse_invalidate`
/// expects it (used by the control client).
pub fn encode_invalidate_pair(command: TranslationCommand, value: &str) -> Vec<u8> {
    let header = TranslationHeader {
        length: value.len() as u16,
        command: command as u16,
    };

    let mut buffer = Vec::with_capacity(HEADER_SIZE + padded_length(value.len()));
    buffer.extend_from_slice(&header.encode());
    buffer.extend_from_slice(value.as_bytes());
    buffer.resize(HEADER_SIZE + padded_length(value.len()), 0);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut wire = encode_invalidate_pair(TranslationCommand::Host, "example.com");
        wire.extend_from_slice(&encode_invalidate_pair(TranslationCommand::Uri, "/x"));
        wire.extend_from_slice(&encode_invalidate_pair(TranslationCommand::Site, "shop"));

        let request = parse_invalidate(&wire).expect("parse");
        assert_eq!(request.host.as_deref(), Some("example.com"));
        assert_eq!(request.uri.as_deref(), Some("/x"));
        assert_eq!(request.site.as_deref(), Some("shop"));
        assert_eq!(
            request.commands,
            [TranslationCommand::Host, TranslationCommand::Uri]
        );
    }

    #[test]
    fn unpadded_payload_is_fatal() {
        let wire = vec![1u8, 0, 0];
        assert!(parse_invalidate(&wire).is_err());
    }

    #[test]
    fn unsupported_command_is_fatal() {
        let wire = encode_invalidate_pair(TranslationCommand::Execute, "/bin/sh");
        assert!(parse_invalidate(&wire).is_err());
    }
}
