//! Serializing a request descriptor into the wire format.

use super::protocol::{PROTOCOL_VERSION, TranslationCommand, TranslationError, TranslationHeader};
use super::request::TranslateRequest;

#[derive(Default)]
pub struct TranslationMarshaller {
    buffer: Vec<u8>,
}

impl TranslationMarshaller {
    pub fn write(
        &mut self,
        command: TranslationCommand,
        payload: &[u8],
    ) -> Result<(), TranslationError> {
        let length = u16::try_from(payload.len()).map_err(|_| TranslationError::Malformed)?;

        let header = TranslationHeader {
            length,
            command: command as u16,
        };
        self.buffer.extend_from_slice(&header.encode());
        self.buffer.extend_from_slice(payload);
        Ok(())
    }

    pub fn write_empty(&mut self, command: TranslationCommand) -> Result<(), TranslationError> {
        self.write(command, &[])
    }

    /// Write a record with a raw command number (used by tests and
    /// the invalidation encoder).
    pub fn write_raw(&mut self, command: u16, payload: &[u8]) -> Result<(), TranslationError> {
        let length = u16::try_from(payload.len()).map_err(|_| TranslationError::Malformed)?;

        let header = TranslationHeader { length, command };
        self.buffer.extend_from_slice(&header.encode());
        self.buffer.extend_from_slice(payload);
        Ok(())
    }

    fn write_optional(
        &mut self,
        command: TranslationCommand,
        payload: Option<&str>,
    ) -> Result<(), TranslationError> {
        if let Some(payload) = payload {
            self.write(command, payload.as_bytes())?;
        }
        Ok(())
    }

    fn write_optional_raw(
        &mut self,
        command: TranslationCommand,
        payload: Option<&[u8]>,
    ) -> Result<(), TranslationError> {
        if let Some(payload) = payload {
            self.write(command, payload)?;
        }
        Ok(())
    }

    pub fn commit(self) -> Vec<u8> {
        self.buffer
    }
}

/// Serialize one complete request (`BEGIN` ... `END`).
pub fn marshal_translate_request(
    request: &TranslateRequest,
) -> Result<Vec<u8>, TranslationError> {
    let mut m = TranslationMarshaller::default();

    m.write(TranslationCommand::Begin, &[PROTOCOL_VERSION])?;

    m.write_optional(
        TranslationCommand::ListenerTag,
        request.listener_tag.as_deref(),
    )?;
    m.write_optional(
        TranslationCommand::LocalAddressString,
        request.local_address.as_deref(),
    )?;
    m.write_optional(TranslationCommand::RemoteHost, request.remote_host.as_deref())?;
    m.write_optional(TranslationCommand::Host, request.host.as_deref())?;
    m.write_optional(TranslationCommand::AltHost, request.alt_host.as_deref())?;
    m.write_optional(TranslationCommand::UserAgent, request.user_agent.as_deref())?;
    m.write_optional(
        TranslationCommand::Language,
        request.accept_language.as_deref(),
    )?;
    m.write_optional(
        TranslationCommand::Authorization,
        request.authorization.as_deref(),
    )?;
    m.write_optional(TranslationCommand::Uri, request.uri.as_deref())?;
    m.write_optional(TranslationCommand::Args, request.args.as_deref())?;
    m.write_optional(
        TranslationCommand::QueryString,
        request.query_string.as_deref(),
    )?;
    m.write_optional(TranslationCommand::WidgetType, request.widget_type.as_deref())?;
    m.write_optional_raw(TranslationCommand::Session, request.session.as_deref())?;
    m.write_optional_raw(
        TranslationCommand::RealmSession,
        request.realm_session.as_deref(),
    )?;
    m.write_optional(TranslationCommand::Param, request.param.as_deref())?;
    m.write_optional(TranslationCommand::User, request.user.as_deref())?;
    m.write_optional_raw(
        TranslationCommand::InternalRedirect,
        request.internal_redirect.as_deref(),
    )?;
    m.write_optional_raw(TranslationCommand::Enotdir, request.enotdir.as_deref())?;
    m.write_optional_raw(
        TranslationCommand::MountListenStream,
        request.mount_listen_stream.as_deref(),
    )?;

    m.write_empty(TranslationCommand::End)?;

    Ok(m.commit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_and_end_frame_the_request() {
        let request = TranslateRequest {
            uri: Some("/index.html".to_owned()),
            host: Some("example.com".to_owned()),
            ..Default::default()
        };

        let wire = marshal_translate_request(&request).expect("marshal");

        let begin = TranslationHeader::parse(wire[..4].try_into().expect("header"));
        assert_eq!(begin.command, TranslationCommand::Begin as u16);
        assert_eq!(begin.length, 1);
        assert_eq!(wire[4], PROTOCOL_VERSION);

        let end = TranslationHeader::parse(wire[wire.len() - 4..].try_into().expect("header"));
        assert_eq!(end.command, TranslationCommand::End as u16);
        assert_eq!(end.length, 0);
    }

    #[test]
    fn oversize_payload_is_refused() {
        let mut m = TranslationMarshaller::default();
        let big = vec![0u8; 0x1_0000];
        assert!(m.write(TranslationCommand::Uri, &big).is_err());
    }
}
