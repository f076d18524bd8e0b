//! The streaming translation-response parser.
//!
//! Records arrive on a stream socket; this parser consumes complete
//! records, assembles the resource address and child options
//! incrementally, and reports completion when `END` is seen.

use super::protocol::{HEADER_SIZE, TranslationCommand, TranslationError, TranslationHeader};
use super::response::TranslateResponse;
use crate::address::{
    AddressList, CgiAddress, FileAddress, HttpAddress, LhttpAddress, ResolvedAddress,
    ResourceAddress,
};
use crate::spawn::ChildOptions;
use crate::spawn::mount::Mount;
use crate::uri::base::is_base;

/// Upper bound on `APPEND_ARG` records per response.
const MAX_ARGS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CgiKind {
    Pipe,
    Cgi,
    Fastcgi,
    Was,
}

enum CurrentAddress {
    None,
    File(FileAddress),
    Http(HttpAddress),
    Lhttp(LhttpAddress),
    Cgi(CgiKind, CgiAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionsTarget {
    None,

    /// The `EXECUTE` block of a listen-stream response.
    Execute,

    /// The current resource address.
    Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    More,
    Done,
}

pub struct TranslateParser {
    buffer: Vec<u8>,

    begun: bool,
    done: bool,

    response: TranslateResponse,
    address: CurrentAddress,
    options_target: OptionsTarget,
}

impl Default for TranslateParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslateParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            begun: false,
            done: false,
            response: TranslateResponse::default(),
            address: CurrentAddress::None,
            options_target: OptionsTarget::None,
        }
    }

    /// Feed received bytes; consumes all complete records.
    pub fn feed(&mut self, data: &[u8]) -> Result<ParseResult, TranslationError> {
        debug_assert!(!self.done);

        self.buffer.extend_from_slice(data);

        loop {
            if self.buffer.len() < HEADER_SIZE {
                return Ok(ParseResult::More);
            }

            let header = TranslationHeader::parse(
                self.buffer[..HEADER_SIZE]
                    .try_into()
                    .expect("slice of HEADER_SIZE"),
            );
            let total = HEADER_SIZE + usize::from(header.length);
            if self.buffer.len() < total {
                return Ok(ParseResult::More);
            }

            let payload: Vec<u8> = self.buffer[HEADER_SIZE..total].to_vec();
            self.buffer.drain(..total);

            if let ParseResult::Done = self.handle_packet(header.command, &payload)? {
                self.done = true;
                return Ok(ParseResult::Done);
            }
        }
    }

    /// Take the finished response.
    pub fn into_response(self) -> TranslateResponse {
        debug_assert!(self.done);
        self.response
    }

    fn handle_packet(
        &mut self,
        raw_command: u16,
        payload: &[u8],
    ) -> Result<ParseResult, TranslationError> {
        let Some(command) = TranslationCommand::from_u16(raw_command) else {
            /* tolerate unknown commands */
            tracing::debug!(command = raw_command, "ignoring unknown translation packet");
            return Ok(ParseResult::More);
        };

        if !self.begun {
            if command != TranslationCommand::Begin {
                return Err(TranslationError::Misplaced(command));
            }
            self.begun = true;
            return Ok(ParseResult::More);
        }

        use TranslationCommand as C;

        match command {
            C::Begin => return Err(TranslationError::Misplaced(command)),

            C::End => {
                self.finish()?;
                return Ok(ParseResult::Done);
            }

            C::Status => {
                if payload.len() != 2 {
                    return Err(TranslationError::InvalidPayload(command));
                }
                self.response.status = u16::from_le_bytes([payload[0], payload[1]]);
            }

            /* resource addresses */
            C::Path => {
                self.set_address(CurrentAddress::File(FileAddress::new(string(
                    command, payload,
                )?)))?;
            }

            C::Http => {
                let http = HttpAddress::parse(string(command, payload)?)?;
                self.set_address(CurrentAddress::Http(http))?;
            }

            C::LhttpPath => {
                self.set_address(CurrentAddress::Lhttp(LhttpAddress::new(string(
                    command, payload,
                )?)))?;
                self.options_target = OptionsTarget::Address;
            }

            C::LhttpUri => match &mut self.address {
                CurrentAddress::Lhttp(lhttp) => {
                    lhttp.uri = string(command, payload)?.to_owned();
                }
                _ => return Err(TranslationError::Misplaced(command)),
            },

            C::LhttpHost => match &mut self.address {
                CurrentAddress::Lhttp(lhttp) => {
                    lhttp.host_and_port = Some(string(command, payload)?.to_owned());
                }
                _ => return Err(TranslationError::Misplaced(command)),
            },

            C::Cgi => self.begin_cgi(CgiKind::Cgi, payload)?,
            C::Fastcgi => self.begin_cgi(CgiKind::Fastcgi, payload)?,
            C::Was => self.begin_cgi(CgiKind::Was, payload)?,
            C::Pipe => self.begin_cgi(CgiKind::Pipe, payload)?,

            C::Address | C::AddressString => {
                let address = if command == C::AddressString {
                    parse_address_string(string(command, payload)?)
                        .ok_or(TranslationError::InvalidPayload(command))?
                } else {
                    parse_sockaddr(payload).ok_or(TranslationError::InvalidPayload(command))?
                };

                self.address_list_mut()
                    .ok_or(TranslationError::Misplaced(command))?
                    .push(address);
            }

            C::DocumentRoot => {
                let value = string(command, payload)?.to_owned();
                match &mut self.address {
                    CurrentAddress::File(file) => file.document_root = Some(value),
                    CurrentAddress::Cgi(_, cgi) => cgi.document_root = Some(value),
                    _ => return Err(TranslationError::Misplaced(command)),
                }
            }

            C::ScriptName => {
                self.cgi_mut(command)?.script_name = Some(string(command, payload)?.to_owned());
            }

            C::PathInfo => {
                self.cgi_mut(command)?.path_info = Some(string(command, payload)?.to_owned());
            }

            C::QueryString => {
                self.cgi_mut(command)?.query_string = Some(string(command, payload)?.to_owned());
            }

            C::Action => {
                self.cgi_mut(command)?.action = Some(string(command, payload)?.to_owned());
            }

            C::Interpreter => {
                self.cgi_mut(command)?.interpreter = Some(string(command, payload)?.to_owned());
            }

            C::Parameter => {
                self.cgi_mut(command)?
                    .params
                    .push(string(command, payload)?.to_owned());
            }

            C::ContentType => match &mut self.address {
                CurrentAddress::File(file) => {
                    file.content_type = Some(string(command, payload)?.to_owned());
                }
                _ => return Err(TranslationError::Misplaced(command)),
            },

            C::Deflated => match &mut self.address {
                CurrentAddress::File(file) => {
                    file.deflated = Some(string(command, payload)?.to_owned());
                }
                _ => return Err(TranslationError::Misplaced(command)),
            },

            C::Gzipped => match &mut self.address {
                CurrentAddress::File(file) => {
                    file.gzipped = Some(string(command, payload)?.to_owned());
                }
                _ => return Err(TranslationError::Misplaced(command)),
            },

            /* base handling */
            C::Base => {
                let base = string(command, payload)?;
                if !is_base(base) {
                    return Err(TranslationError::InvalidPayload(command));
                }
                self.response.base = Some(base.to_owned());
            }

            C::EasyBase => self.response.easy_base = true,
            C::UnsafeBase => self.response.unsafe_base = true,
            C::AutoBase => self.response.auto_base = true,

            /* process execution */
            C::Execute => {
                self.response.execute = Some(string(command, payload)?.to_owned());
                self.options_target = OptionsTarget::Execute;
            }

            C::AppendArg => {
                let value = string(command, payload)?.to_owned();
                match (&mut self.address, self.options_target) {
                    (_, OptionsTarget::Execute) => {
                        if self.response.args.len() >= MAX_ARGS {
                            return Err(TranslationError::InvalidPayload(command));
                        }
                        self.response.args.push(value);
                    }
                    (CurrentAddress::Cgi(_, cgi), _) => {
                        if cgi.args.len() >= MAX_ARGS {
                            return Err(TranslationError::InvalidPayload(command));
                        }
                        cgi.args.push(value);
                    }
                    (CurrentAddress::Lhttp(lhttp), _) => {
                        if lhttp.args.len() >= MAX_ARGS {
                            return Err(TranslationError::InvalidPayload(command));
                        }
                        lhttp.args.push(value);
                    }
                    _ => return Err(TranslationError::Misplaced(command)),
                }
            }

            C::ChildOptions => {
                /* opens a nested options block for the current
                   address or EXECUTE */
                self.current_options(command)?;
            }

            C::Pair | C::Setenv => {
                let value = string(command, payload)?;
                if !value.contains('=') {
                    return Err(TranslationError::InvalidPayload(command));
                }
                self.current_options(command)?.env.push(value.to_owned());
            }

            C::StderrPath => {
                self.current_options(command)?.stderr_path =
                    Some(string(command, payload)?.to_owned());
            }

            C::StderrNull => self.current_options(command)?.stderr_null = true,

            C::Rlimits => {
                let value = string(command, payload)?;
                let options = self.current_options(command)?;
                if !options.rlimits.parse(value) {
                    return Err(TranslationError::InvalidPayload(command));
                }
            }

            C::UserNamespace => self.current_options(command)?.ns.enable_user = true,
            C::PidNamespace => self.current_options(command)?.ns.enable_pid = true,
            C::NetworkNamespace => self.current_options(command)?.ns.enable_network = true,
            C::IpcNamespace => self.current_options(command)?.ns.enable_ipc = true,
            C::MountNamespace => self.current_options(command)?.ns.enable_mount = true,
            C::MountProc => self.current_options(command)?.ns.mount_proc = true,

            C::PivotRoot => {
                let value = string(command, payload)?.to_owned();
                let options = self.current_options(command)?;
                options.ns.enable_mount = true;
                options.ns.pivot_root = Some(value);
            }

            C::MountHome => {
                self.current_options(command)?.ns.mount_home =
                    Some(string(command, payload)?.to_owned());
            }

            C::Home => {
                self.current_options(command)?.ns.home =
                    Some(string(command, payload)?.to_owned());
            }

            C::MountTmpTmpfs => {
                self.current_options(command)?.ns.mount_tmp_tmpfs =
                    Some(string(command, payload)?.to_owned());
            }

            C::MountTmpfs => {
                self.current_options(command)?.ns.mount_tmpfs =
                    Some(string(command, payload)?.to_owned());
            }

            C::BindMount => self.bind_mount(command, payload, false, false)?,
            C::BindMountRw => self.bind_mount(command, payload, true, false)?,
            C::BindMountExec => self.bind_mount(command, payload, true, true)?,

            C::UtsNamespace => {
                self.current_options(command)?.ns.hostname =
                    Some(string(command, payload)?.to_owned());
            }

            C::CgroupName => {
                self.current_options(command)?.cgroup.name =
                    Some(string(command, payload)?.to_owned());
            }

            C::CgroupSet => {
                let value = string(command, payload)?;
                let (name, value) = value
                    .split_once('=')
                    .ok_or(TranslationError::InvalidPayload(command))?;
                self.current_options(command)?
                    .cgroup
                    .set
                    .push((name.to_owned(), value.to_owned()));
            }

            C::UidGid => {
                let options = self.current_options(command)?;
                parse_uid_gid(payload, options)
                    .ok_or(TranslationError::InvalidPayload(command))?;
            }

            C::NoNewPrivs => self.current_options(command)?.no_new_privs = true,

            C::Refence => {
                self.current_options(command)?.refence.set(payload);
            }

            C::ChildTag => {
                let value = string(command, payload)?;
                let options = self.current_options(command)?;
                if options.tag.is_empty() {
                    options.tag = value.to_owned();
                } else {
                    options.tag.push('\0');
                    options.tag.push_str(value);
                }
            }

            C::Priority => {
                if payload.len() != 4 {
                    return Err(TranslationError::InvalidPayload(command));
                }
                let priority =
                    i32::from_le_bytes(payload.try_into().expect("4 bytes were checked"));
                self.current_options(command)?.priority = priority;
            }

            C::Parallelism => {
                let value = u16_payload(command, payload)?;
                match &mut self.address {
                    CurrentAddress::Cgi(_, cgi) => cgi.parallelism = u32::from(value),
                    CurrentAddress::Lhttp(lhttp) => lhttp.parallelism = u32::from(value),
                    _ => return Err(TranslationError::Misplaced(command)),
                }
            }

            C::Concurrency => {
                let value = u16_payload(command, payload)?;
                match &mut self.address {
                    CurrentAddress::Cgi(_, cgi) => cgi.concurrency = u32::from(value),
                    CurrentAddress::Lhttp(lhttp) => lhttp.concurrency = u32::from(value),
                    _ => return Err(TranslationError::Misplaced(command)),
                }
            }

            C::Disposable => {
                self.cgi_mut(command)?.disposable = true;
            }

            C::RequestUriVerbatim => {
                self.cgi_mut(command)?.request_uri_verbatim = true;
            }

            C::MountListenStream => {
                let value = String::from_utf8(payload.to_vec())
                    .map_err(|_| TranslationError::InvalidPayload(command))?;
                self.current_options(command)?.ns.mount_listen_stream = Some(value);
            }

            /* request-only commands are tolerated and ignored */
            C::Host | C::Uri | C::Session | C::Param | C::User | C::Language | C::RemoteHost
            | C::Site | C::UserAgent | C::ListenerTag | C::LocalAddress
            | C::LocalAddressString | C::Authorization | C::Args | C::InternalRedirect
            | C::Enotdir | C::Want | C::RealmSession | C::WidgetType | C::AltHost => {}
        }

        Ok(ParseResult::More)
    }

    fn set_address(&mut self, address: CurrentAddress) -> Result<(), TranslationError> {
        if !matches!(self.address, CurrentAddress::None) {
            return Err(TranslationError::Malformed);
        }

        self.options_target = match &address {
            CurrentAddress::Cgi(..) | CurrentAddress::Lhttp(_) => OptionsTarget::Address,
            _ => OptionsTarget::None,
        };
        self.address = address;
        Ok(())
    }

    fn begin_cgi(&mut self, kind: CgiKind, payload: &[u8]) -> Result<(), TranslationError> {
        let path = string(TranslationCommand::Cgi, payload)?;
        self.set_address(CurrentAddress::Cgi(kind, CgiAddress::new(path)))
    }

    fn cgi_mut(&mut self, command: TranslationCommand) -> Result<&mut CgiAddress, TranslationError> {
        match &mut self.address {
            CurrentAddress::Cgi(_, cgi) => Ok(cgi),
            _ => Err(TranslationError::Misplaced(command)),
        }
    }

    fn address_list_mut(&mut self) -> Option<&mut AddressList> {
        match &mut self.address {
            CurrentAddress::Http(http) => Some(&mut http.addresses),
            CurrentAddress::Cgi(_, cgi) => Some(&mut cgi.address_list),
            _ => None,
        }
    }

    fn current_options(
        &mut self,
        command: TranslationCommand,
    ) -> Result<&mut ChildOptions, TranslationError> {
        match self.options_target {
            OptionsTarget::Execute => Ok(&mut self.response.child_options),
            OptionsTarget::Address => match &mut self.address {
                CurrentAddress::Cgi(_, cgi) => Ok(&mut cgi.options),
                CurrentAddress::Lhttp(lhttp) => Ok(&mut lhttp.options),
                _ => Err(TranslationError::Misplaced(command)),
            },
            OptionsTarget::None => Err(TranslationError::Misplaced(command)),
        }
    }

    fn bind_mount(
        &mut self,
        command: TranslationCommand,
        payload: &[u8],
        writable: bool,
        exec: bool,
    ) -> Result<(), TranslationError> {
        let text =
            std::str::from_utf8(payload).map_err(|_| TranslationError::InvalidPayload(command))?;
        let (source, target) = text
            .split_once('\0')
            .ok_or(TranslationError::InvalidPayload(command))?;
        if source.is_empty() || !target.starts_with('/') {
            return Err(TranslationError::InvalidPayload(command));
        }

        let options = self.current_options(command)?;
        options.ns.enable_mount = true;
        options
            .ns
            .mounts
            .push(Mount::bind(source.trim_start_matches('/'), target, writable, exec));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TranslationError> {
        let address = match std::mem::replace(&mut self.address, CurrentAddress::None) {
            CurrentAddress::None => ResourceAddress::None,
            CurrentAddress::File(file) => ResourceAddress::Local(file),
            CurrentAddress::Http(http) => ResourceAddress::Http(http),
            CurrentAddress::Lhttp(lhttp) => ResourceAddress::Lhttp(lhttp),
            CurrentAddress::Cgi(CgiKind::Pipe, cgi) => ResourceAddress::Pipe(cgi),
            CurrentAddress::Cgi(CgiKind::Cgi, cgi) => ResourceAddress::Cgi(cgi),
            CurrentAddress::Cgi(CgiKind::Fastcgi, cgi) => ResourceAddress::Fastcgi(cgi),
            CurrentAddress::Cgi(CgiKind::Was, cgi) => ResourceAddress::Was(cgi),
        };

        address.check()?;
        self.response.address = address;
        Ok(())
    }
}

fn string<'a>(
    command: TranslationCommand,
    payload: &'a [u8],
) -> Result<&'a str, TranslationError> {
    std::str::from_utf8(payload).map_err(|_| TranslationError::InvalidPayload(command))
}

fn u16_payload(
    command: TranslationCommand,
    payload: &[u8],
) -> Result<u16, TranslationError> {
    if payload.len() != 2 {
        return Err(TranslationError::InvalidPayload(command));
    }
    Ok(u16::from_le_bytes([payload[0], payload[1]]))
}

fn parse_uid_gid(payload: &[u8], options: &mut ChildOptions) -> Option<()> {
    if payload.len() < 8 || payload.len() % 4 != 0 {
        return None;
    }

    let mut words = payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().expect("4-byte chunk")));

    options.uid_gid.uid = words.next()?;
    options.uid_gid.gid = words.next()?;

    for (i, gid) in words.enumerate() {
        if i >= options.uid_gid.groups.len() {
            return None;
        }
        options.uid_gid.groups[i] = gid;
    }

    Some(())
}

/// Parse a textual peer address: `ip:port`, an absolute `AF_LOCAL`
/// path, or `@name` in the abstract namespace.
fn parse_address_string(s: &str) -> Option<ResolvedAddress> {
    if s.starts_with('/') || s.starts_with('@') {
        return Some(ResolvedAddress::Local(s.to_owned()));
    }

    s.parse().ok().map(ResolvedAddress::Inet)
}

/// Parse a raw `struct sockaddr` blob.
fn parse_sockaddr(payload: &[u8]) -> Option<ResolvedAddress> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    if payload.len() < 2 {
        return None;
    }

    let family = u16::from_ne_bytes([payload[0], payload[1]]);

    match i32::from(family) {
        libc::AF_INET => {
            if payload.len() < 8 {
                return None;
            }
            let port = u16::from_be_bytes([payload[2], payload[3]]);
            let addr = Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]);
            Some(ResolvedAddress::Inet(SocketAddr::new(
                IpAddr::V4(addr),
                port,
            )))
        }

        libc::AF_INET6 => {
            if payload.len() < 24 {
                return None;
            }
            let port = u16::from_be_bytes([payload[2], payload[3]]);
            let octets: [u8; 16] = payload[8..24].try_into().ok()?;
            Some(ResolvedAddress::Inet(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }

        libc::AF_UNIX => {
            let raw = &payload[2..];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            if end == 0 && !raw.is_empty() {
                /* abstract namespace: NUL prefix */
                let name = &raw[1..];
                let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                let name = std::str::from_utf8(&name[..end]).ok()?;
                return Some(ResolvedAddress::Local(format!("@{name}")));
            }

            let path = std::str::from_utf8(&raw[..end]).ok()?;
            (!path.is_empty()).then(|| ResolvedAddress::Local(path.to_owned()))
        }

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::marshal::TranslationMarshaller;

    fn build(records: &[(TranslationCommand, &[u8])]) -> Vec<u8> {
        let mut m = TranslationMarshaller::default();
        m.write(TranslationCommand::Begin, &[3]).unwrap();
        for (command, payload) in records {
            m.write(*command, payload).unwrap();
        }
        m.write(TranslationCommand::End, &[]).unwrap();
        m.commit()
    }

    fn parse(records: &[(TranslationCommand, &[u8])]) -> TranslateResponse {
        let wire = build(records);
        let mut parser = TranslateParser::new();
        assert_eq!(parser.feed(&wire).expect("parse"), ParseResult::Done);
        parser.into_response()
    }

    #[test]
    fn parse_execute_response() {
        let response = parse(&[
            (TranslationCommand::Execute, b"/usr/bin/app"),
            (TranslationCommand::AppendArg, b"--listen"),
            (TranslationCommand::ChildOptions, b""),
            (TranslationCommand::Setenv, b"HOME=/nonexistent"),
            (TranslationCommand::UserNamespace, b""),
            (TranslationCommand::PivotRoot, b"/srv/jail"),
            (TranslationCommand::BindMountRw, b"/var/lib/app\0/var/lib/app"),
            (TranslationCommand::ChildTag, b"v1"),
        ]);

        assert_eq!(response.execute.as_deref(), Some("/usr/bin/app"));
        assert_eq!(response.args, ["--listen"]);
        assert_eq!(response.child_options.env, ["HOME=/nonexistent"]);
        assert!(response.child_options.ns.enable_user);
        assert_eq!(response.child_options.ns.pivot_root.as_deref(), Some("/srv/jail"));
        assert_eq!(response.child_options.ns.mounts.len(), 1);
        assert!(response.child_options.ns.mounts[0].writable);
        assert_eq!(response.child_tag(), "v1");
    }

    #[test]
    fn parse_was_address() {
        let response = parse(&[
            (TranslationCommand::Was, b"/usr/lib/was/app"),
            (TranslationCommand::AppendArg, b"--threads=4"),
            (TranslationCommand::ScriptName, b"/app/"),
            (TranslationCommand::PathInfo, b"x/y"),
            (TranslationCommand::Parallelism, &2u16.to_le_bytes()),
            (TranslationCommand::Concurrency, &8u16.to_le_bytes()),
            (TranslationCommand::Base, b"/app/"),
        ]);

        let ResourceAddress::Was(cgi) = &response.address else {
            panic!("expected a WAS address");
        };
        assert_eq!(cgi.path, "/usr/lib/was/app");
        assert_eq!(cgi.args, ["--threads=4"]);
        assert_eq!(cgi.parallelism, 2);
        assert_eq!(cgi.concurrency, 8);
        assert_eq!(response.base.as_deref(), Some("/app/"));
    }

    #[test]
    fn parse_file_address() {
        let response = parse(&[
            (TranslationCommand::Path, b"/var/www/index.html"),
            (TranslationCommand::ContentType, b"text/html"),
        ]);

        assert_eq!(
            response.address.file_path(),
            Some("/var/www/index.html")
        );
    }

    #[test]
    fn parse_lhttp_address() {
        let response = parse(&[
            (TranslationCommand::LhttpPath, b"/usr/bin/app-server"),
            (TranslationCommand::LhttpUri, b"/x"),
            (TranslationCommand::Concurrency, &4u16.to_le_bytes()),
        ]);

        let ResourceAddress::Lhttp(lhttp) = &response.address else {
            panic!("expected an LHTTP address");
        };
        assert_eq!(lhttp.uri, "/x");
        assert_eq!(lhttp.concurrency, 4);
    }

    #[test]
    fn lhttp_without_uri_is_invalid() {
        let wire = build(&[(TranslationCommand::LhttpPath, b"/usr/bin/app-server")]);
        let mut parser = TranslateParser::new();
        assert!(parser.feed(&wire).is_err());
    }

    #[test]
    fn remote_was_address_requires_af_local() {
        /* an inet ADDRESS_STRING on a WAS response must fail the
           final check */
        let wire = build(&[
            (TranslationCommand::Was, b"/usr/lib/was/app"),
            (TranslationCommand::Concurrency, &2u16.to_le_bytes()),
            (TranslationCommand::AddressString, b"127.0.0.1:9000"),
        ]);
        let mut parser = TranslateParser::new();
        assert!(parser.feed(&wire).is_err());

        let response = parse(&[
            (TranslationCommand::Was, b"/usr/lib/was/app"),
            (TranslationCommand::Concurrency, &2u16.to_le_bytes()),
            (TranslationCommand::AddressString, b"/run/app.was"),
        ]);
        assert!(matches!(response.address, ResourceAddress::Was(_)));
    }

    #[test]
    fn unknown_commands_are_tolerated() {
        let mut m = TranslationMarshaller::default();
        m.write(TranslationCommand::Begin, &[3]).unwrap();
        /* command 999 does not exist */
        m.write_raw(999, b"whatever").unwrap();
        m.write(TranslationCommand::Path, b"/var/www/x").unwrap();
        m.write(TranslationCommand::End, &[]).unwrap();

        let mut parser = TranslateParser::new();
        assert_eq!(parser.feed(&m.commit()).expect("parse"), ParseResult::Done);
    }

    #[test]
    fn split_feed_reassembles_records() {
        let wire = build(&[(TranslationCommand::Path, b"/var/www/index.html")]);

        let mut parser = TranslateParser::new();
        let (a, b) = wire.split_at(wire.len() / 2 + 1);
        assert_eq!(parser.feed(a).expect("first half"), ParseResult::More);
        assert_eq!(parser.feed(b).expect("second half"), ParseResult::Done);
    }

    #[test]
    fn status_packet() {
        let response = parse(&[(TranslationCommand::Status, &500u16.to_le_bytes())]);
        assert_eq!(response.status, 500);
    }

    #[test]
    fn malformed_base_is_rejected() {
        let wire = build(&[
            (TranslationCommand::Path, b"/var/www/"),
            (TranslationCommand::Base, b"/no-slash"),
        ]);
        let mut parser = TranslateParser::new();
        assert!(parser.feed(&wire).is_err());
    }
}
