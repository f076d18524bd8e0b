//! The single-writer datagram protocol between the main process and
//! the spawner sidecar.
//!
//! Every message is one `SOCK_SEQPACKET` datagram: a command byte
//! followed by a sequence of typed sub-records (`tag:u8 [payload]`).
//! Strings are NUL-terminated, integers little-endian.  File
//! descriptors ride in the ancillary `SCM_RIGHTS` block, order-matched
//! to the fd-bearing records within the same datagram.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use thiserror::Error;

use super::prepared::PreparedChildProcess;
use super::rlimit::ResourceLimit;

/// Maximum size of one datagram.
pub const MAX_DATAGRAM: usize = 65536;

/// Maximum number of file descriptors per datagram.
pub const MAX_FDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCommand {
    /// Hand a private sub-channel socket to the spawner.
    Connect = 0,

    /// Spawn a child process.
    Exec = 1,

    /// Send a signal to a child process.
    Kill = 2,
}

impl TryFrom<u8> for RequestCommand {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Exec),
            2 => Ok(Self::Kill),
            _ => Err(ProtocolError::Malformed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCommand {
    /// `id:i32 status:i32` - a child process has exited.
    Exit = 0,
}

impl TryFrom<u8> for ResponseCommand {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Exit),
            _ => Err(ProtocolError::Malformed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecCommand {
    Arg = 0,
    Setenv = 1,
    Stdin = 2,
    Stdout = 3,
    Stderr = 4,
    Control = 5,
    Refence = 6,
    UserNs = 7,
    PidNs = 8,
    NetworkNs = 9,
    IpcNs = 10,
    MountNs = 11,
    MountProc = 12,
    PivotRoot = 13,
    MountHome = 14,
    MountTmpTmpfs = 15,
    MountTmpfs = 16,
    BindMount = 17,
    Hostname = 18,
    Rlimit = 19,
    UidGid = 20,
    NoNewPrivs = 21,
    Cgroup = 22,
    CgroupSet = 23,
    Priority = 24,
    Chroot = 25,
}

impl TryFrom<u8> for ExecCommand {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Self::Arg,
            1 => Self::Setenv,
            2 => Self::Stdin,
            3 => Self::Stdout,
            4 => Self::Stderr,
            5 => Self::Control,
            6 => Self::Refence,
            7 => Self::UserNs,
            8 => Self::PidNs,
            9 => Self::NetworkNs,
            10 => Self::IpcNs,
            11 => Self::MountNs,
            12 => Self::MountProc,
            13 => Self::PivotRoot,
            14 => Self::MountHome,
            15 => Self::MountTmpTmpfs,
            16 => Self::MountTmpfs,
            17 => Self::BindMount,
            18 => Self::Hostname,
            19 => Self::Rlimit,
            20 => Self::UidGid,
            21 => Self::NoNewPrivs,
            22 => Self::Cgroup,
            23 => Self::CgroupSet,
            24 => Self::Priority,
            25 => Self::Chroot,
            _ => return Err(ProtocolError::Malformed),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("spawn payload too large")]
    PayloadTooLarge,

    #[error("malformed spawn payload")]
    Malformed,
}

/// Serializes one datagram.
pub struct Serializer {
    buffer: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl Serializer {
    pub fn request(cmd: RequestCommand) -> Self {
        Self {
            buffer: vec![cmd as u8],
            fds: Vec::new(),
        }
    }

    pub fn response(cmd: ResponseCommand) -> Self {
        Self {
            buffer: vec![cmd as u8],
            fds: Vec::new(),
        }
    }

    pub fn write_byte(&mut self, value: u8) -> Result<(), ProtocolError> {
        self.write(&[value])
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.buffer.len() + data.len() > MAX_DATAGRAM {
            return Err(ProtocolError::PayloadTooLarge);
        }

        self.buffer.extend_from_slice(data);
        Ok(())
    }

    pub fn write_command(&mut self, cmd: ExecCommand) -> Result<(), ProtocolError> {
        self.write_byte(cmd as u8)
    }

    pub fn write_optional(&mut self, cmd: ExecCommand, value: bool) -> Result<(), ProtocolError> {
        if value {
            self.write_command(cmd)?;
        }
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), ProtocolError> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), ProtocolError> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        debug_assert!(!value.contains('\0'));

        self.write(value.as_bytes())?;
        self.write_byte(0)
    }

    pub fn write_string_command(
        &mut self,
        cmd: ExecCommand,
        value: &str,
    ) -> Result<(), ProtocolError> {
        self.write_command(cmd)?;
        self.write_string(value)
    }

    pub fn write_optional_string(
        &mut self,
        cmd: ExecCommand,
        value: Option<&str>,
    ) -> Result<(), ProtocolError> {
        if let Some(value) = value {
            self.write_string_command(cmd, value)?;
        }
        Ok(())
    }

    pub fn write_fd(&mut self, cmd: ExecCommand, fd: OwnedFd) -> Result<(), ProtocolError> {
        self.write_command(cmd)?;
        self.push_fd(fd)
    }

    /// Attach a file descriptor without a record referencing it (used
    /// by `CONNECT`, whose single fd is implied by the command).
    pub fn push_fd(&mut self, fd: OwnedFd) -> Result<(), ProtocolError> {
        if self.fds.len() >= MAX_FDS {
            return Err(ProtocolError::PayloadTooLarge);
        }

        self.fds.push(fd);
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }
}

/// Reads typed fields from a received datagram payload.
pub struct Payload<'a> {
    data: &'a [u8],
}

impl<'a> Payload<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        let (&first, rest) = self.data.split_first().ok_or(ProtocolError::Malformed)?;
        self.data = rest;
        Ok(first)
    }

    pub fn read(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.data.len() < n {
            return Err(ProtocolError::Malformed);
        }

        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.read(4)?;
        Ok(i32::from_le_bytes(b.try_into().expect("split_at returned 4 bytes")))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.read(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("split_at returned 4 bytes")))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.read(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("split_at returned 8 bytes")))
    }

    pub fn read_string(&mut self) -> Result<&'a str, ProtocolError> {
        let nul = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::Malformed)?;

        let (head, rest) = self.data.split_at(nul);
        self.data = &rest[1..];
        std::str::from_utf8(head).map_err(|_| ProtocolError::Malformed)
    }
}

/// The file descriptors received with one datagram, consumed in
/// record order.
#[derive(Default)]
pub struct FdList {
    fds: VecDeque<OwnedFd>,
}

impl FdList {
    pub fn new(fds: Vec<OwnedFd>) -> Self {
        Self { fds: fds.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn get(&mut self) -> Result<OwnedFd, ProtocolError> {
        self.fds.pop_front().ok_or(ProtocolError::Malformed)
    }
}

/// Send one datagram with its ancillary file descriptors.
pub fn send_message(
    socket: BorrowedFd<'_>,
    payload: &[u8],
    fds: &[OwnedFd],
) -> nix::Result<()> {
    let iov = [IoSlice::new(payload)];
    let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();

    let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() {
        &[]
    } else {
        &[ControlMessage::ScmRights(&raw_fds)]
    };

    sendmsg::<()>(
        socket.as_raw_fd(),
        &iov,
        cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    Ok(())
}

/// Like `send_message()`, but to an explicit datagram destination.
pub fn send_message_to(
    socket: BorrowedFd<'_>,
    payload: &[u8],
    fds: &[OwnedFd],
    addr: &nix::sys::socket::UnixAddr,
) -> nix::Result<()> {
    let iov = [IoSlice::new(payload)];
    let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();

    let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() {
        &[]
    } else {
        &[ControlMessage::ScmRights(&raw_fds)]
    };

    sendmsg(
        socket.as_raw_fd(),
        &iov,
        cmsgs,
        MsgFlags::MSG_NOSIGNAL,
        Some(addr),
    )?;
    Ok(())
}

/// Receive one datagram; returns the payload length and the received
/// file descriptors.
pub fn receive_message(
    socket: BorrowedFd<'_>,
    buffer: &mut [u8],
    flags: MsgFlags,
) -> nix::Result<(usize, Vec<OwnedFd>)> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);
    let mut iov = [IoSliceMut::new(buffer)];

    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        flags | MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                // SAFETY: the kernel just handed us this descriptor
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    Ok((msg.bytes, fds))
}

/// Serialize the `EXEC` record sequence for one spawn request.  File
/// descriptors are moved out of `p` into the serializer.
pub fn serialize_exec(
    s: &mut Serializer,
    p: &mut PreparedChildProcess,
) -> Result<(), ProtocolError> {
    for i in &p.args {
        s.write_string_command(ExecCommand::Arg, i)?;
    }

    for i in &p.env {
        s.write_string_command(ExecCommand::Setenv, i)?;
    }

    if let Some(fd) = p.stdin.take() {
        s.write_fd(ExecCommand::Stdin, fd)?;
    }
    if let Some(fd) = p.stdout.take() {
        s.write_fd(ExecCommand::Stdout, fd)?;
    }
    if let Some(fd) = p.stderr.take() {
        s.write_fd(ExecCommand::Stderr, fd)?;
    }
    if let Some(fd) = p.control.take() {
        s.write_fd(ExecCommand::Control, fd)?;
    }

    if p.priority != 0 {
        s.write_command(ExecCommand::Priority)?;
        s.write_i32(p.priority)?;
    }

    if let Some(name) = &p.cgroup.name {
        s.write_string_command(ExecCommand::Cgroup, name)?;
        for (set_name, set_value) in &p.cgroup.set {
            s.write_command(ExecCommand::CgroupSet)?;
            s.write_string(set_name)?;
            s.write_string(set_value)?;
        }
    }

    if !p.refence.is_empty() {
        s.write_command(ExecCommand::Refence)?;
        let data = p.refence.get();
        s.write(&(u16::try_from(data.len()).map_err(|_| ProtocolError::PayloadTooLarge)?)
            .to_le_bytes())?;
        s.write(data)?;
    }

    let ns = &p.ns;
    s.write_optional(ExecCommand::UserNs, ns.enable_user)?;
    s.write_optional(ExecCommand::PidNs, ns.enable_pid)?;
    s.write_optional(ExecCommand::NetworkNs, ns.enable_network)?;
    s.write_optional(ExecCommand::IpcNs, ns.enable_ipc)?;
    s.write_optional(ExecCommand::MountNs, ns.enable_mount)?;
    s.write_optional(ExecCommand::MountProc, ns.mount_proc)?;
    s.write_optional_string(ExecCommand::PivotRoot, ns.pivot_root.as_deref())?;

    if let (Some(mount_home), Some(home)) = (&ns.mount_home, &ns.home) {
        s.write_command(ExecCommand::MountHome)?;
        s.write_string(mount_home)?;
        s.write_string(home)?;
    }

    s.write_optional_string(ExecCommand::MountTmpTmpfs, ns.mount_tmp_tmpfs.as_deref())?;
    s.write_optional_string(ExecCommand::MountTmpfs, ns.mount_tmpfs.as_deref())?;

    for m in &ns.mounts {
        s.write_command(ExecCommand::BindMount)?;
        s.write_string(&m.source)?;
        s.write_string(&m.target)?;
        s.write_byte(u8::from(m.writable))?;
        s.write_byte(u8::from(m.exec))?;
    }

    s.write_optional_string(ExecCommand::Hostname, ns.hostname.as_deref())?;

    for (i, rlimit) in p.rlimits.values.iter().enumerate() {
        if rlimit.is_empty() {
            continue;
        }

        s.write_command(ExecCommand::Rlimit)?;
        s.write_byte(i as u8)?;
        s.write_u64(rlimit.cur)?;
        s.write_u64(rlimit.max)?;
    }

    if !p.uid_gid.is_empty() {
        s.write_command(ExecCommand::UidGid)?;
        s.write_u32(p.uid_gid.uid)?;
        s.write_u32(p.uid_gid.gid)?;

        let n_groups = p.uid_gid.count_groups();
        s.write_byte(n_groups as u8)?;
        for &gid in &p.uid_gid.groups[..n_groups] {
            s.write_u32(gid)?;
        }
    }

    s.write_optional_string(ExecCommand::Chroot, p.chroot.as_deref())?;

    if p.no_new_privs {
        s.write_command(ExecCommand::NoNewPrivs)?;
    }

    Ok(())
}

/// Parse an `EXEC` record sequence back into spawn parameters.
pub fn parse_exec(
    payload: &mut Payload<'_>,
    fds: &mut FdList,
) -> Result<PreparedChildProcess, ProtocolError> {
    use super::mount::Mount;

    let mut p = PreparedChildProcess::default();

    while !payload.is_empty() {
        let cmd = ExecCommand::try_from(payload.read_byte()?)?;
        match cmd {
            ExecCommand::Arg => {
                if !p.append(payload.read_string()?) {
                    return Err(ProtocolError::Malformed);
                }
            }

            ExecCommand::Setenv => {
                if !p.put_env(payload.read_string()?) {
                    return Err(ProtocolError::Malformed);
                }
            }

            ExecCommand::Stdin => p.stdin = Some(fds.get()?),
            ExecCommand::Stdout => p.stdout = Some(fds.get()?),
            ExecCommand::Stderr => p.stderr = Some(fds.get()?),
            ExecCommand::Control => p.control = Some(fds.get()?),

            ExecCommand::Refence => {
                let len = usize::from(u16::from_le_bytes(
                    payload.read(2)?.try_into().expect("2 bytes"),
                ));
                p.refence.set(payload.read(len)?);
            }

            ExecCommand::UserNs => p.ns.enable_user = true,
            ExecCommand::PidNs => p.ns.enable_pid = true,
            ExecCommand::NetworkNs => p.ns.enable_network = true,
            ExecCommand::IpcNs => p.ns.enable_ipc = true,
            ExecCommand::MountNs => p.ns.enable_mount = true,
            ExecCommand::MountProc => p.ns.mount_proc = true,

            ExecCommand::PivotRoot => p.ns.pivot_root = Some(payload.read_string()?.to_owned()),

            ExecCommand::MountHome => {
                p.ns.mount_home = Some(payload.read_string()?.to_owned());
                p.ns.home = Some(payload.read_string()?.to_owned());
            }

            ExecCommand::MountTmpTmpfs => {
                p.ns.mount_tmp_tmpfs = Some(payload.read_string()?.to_owned());
            }

            ExecCommand::MountTmpfs => {
                p.ns.mount_tmpfs = Some(payload.read_string()?.to_owned());
            }

            ExecCommand::BindMount => {
                let source = payload.read_string()?.to_owned();
                let target = payload.read_string()?.to_owned();
                let writable = payload.read_byte()? != 0;
                let exec = payload.read_byte()? != 0;
                p.ns.mounts.push(Mount::bind(&source, &target, writable, exec));
            }

            ExecCommand::Hostname => p.ns.hostname = Some(payload.read_string()?.to_owned()),

            ExecCommand::Rlimit => {
                let i = usize::from(payload.read_byte()?);
                if i >= p.rlimits.values.len() {
                    return Err(ProtocolError::Malformed);
                }

                p.rlimits.values[i] = ResourceLimit {
                    cur: payload.read_u64()?,
                    max: payload.read_u64()?,
                };
            }

            ExecCommand::UidGid => {
                p.uid_gid.uid = payload.read_u32()?;
                p.uid_gid.gid = payload.read_u32()?;

                let n_groups = usize::from(payload.read_byte()?);
                if n_groups > p.uid_gid.groups.len() {
                    return Err(ProtocolError::Malformed);
                }

                for i in 0..n_groups {
                    p.uid_gid.groups[i] = payload.read_u32()?;
                }
            }

            ExecCommand::NoNewPrivs => p.no_new_privs = true,

            ExecCommand::Cgroup => p.cgroup.name = Some(payload.read_string()?.to_owned()),

            ExecCommand::CgroupSet => {
                let set_name = payload.read_string()?.to_owned();
                let set_value = payload.read_string()?.to_owned();
                p.cgroup.set.push((set_name, set_value));
            }

            ExecCommand::Priority => p.priority = payload.read_i32()?,

            ExecCommand::Chroot => p.chroot = Some(payload.read_string()?.to_owned()),
        }
    }

    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::uid_gid::UidGid;

    fn sample_prepared() -> PreparedChildProcess {
        let mut p = PreparedChildProcess::default();
        p.append("/usr/bin/app");
        p.append("--worker");
        p.set_env("HOME", "/nonexistent");
        p.priority = 5;
        p.ns.enable_user = true;
        p.ns.enable_mount = true;
        p.ns.pivot_root = Some("/srv/jail".to_owned());
        p.ns.mounts.push(super::super::mount::Mount::bind(
            "var/lib/app",
            "/var/lib/app",
            true,
            false,
        ));
        p.ns.hostname = Some("sandbox".to_owned());
        p.rlimits.values[libc::RLIMIT_NOFILE as usize].cur = 1024;
        p.rlimits.values[libc::RLIMIT_NOFILE as usize].max = 4096;
        p.uid_gid = UidGid {
            uid: 33,
            gid: 33,
            ..Default::default()
        };
        p.no_new_privs = true;
        p
    }

    #[test]
    fn exec_round_trip() {
        let mut p = sample_prepared();

        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_i32(42).unwrap();
        s.write_string("app worker").unwrap();
        serialize_exec(&mut s, &mut p).unwrap();

        let mut payload = Payload::new(s.payload());
        assert_eq!(
            RequestCommand::try_from(payload.read_byte().unwrap()).unwrap(),
            RequestCommand::Exec
        );
        assert_eq!(payload.read_i32().unwrap(), 42);
        assert_eq!(payload.read_string().unwrap(), "app worker");

        let mut fds = FdList::default();
        let parsed = parse_exec(&mut payload, &mut fds).unwrap();

        assert_eq!(parsed.args, ["/usr/bin/app", "--worker"]);
        assert_eq!(parsed.env, ["HOME=/nonexistent"]);
        assert_eq!(parsed.priority, 5);
        assert!(parsed.ns.enable_user);
        assert!(parsed.ns.enable_mount);
        assert!(!parsed.ns.enable_network);
        assert_eq!(parsed.ns.pivot_root.as_deref(), Some("/srv/jail"));
        assert_eq!(parsed.ns.mounts.len(), 1);
        assert!(parsed.ns.mounts[0].writable);
        assert_eq!(parsed.ns.hostname.as_deref(), Some("sandbox"));
        assert_eq!(
            parsed.rlimits.values[libc::RLIMIT_NOFILE as usize].cur,
            1024
        );
        assert_eq!(parsed.uid_gid.uid, 33);
        assert!(parsed.no_new_privs);
    }

    #[test]
    fn oversize_payload_is_refused() {
        let mut s = Serializer::request(RequestCommand::Exec);
        let big = "x".repeat(MAX_DATAGRAM);
        assert_eq!(s.write_string(&big), Err(ProtocolError::PayloadTooLarge));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut payload = Payload::new(&[ExecCommand::Rlimit as u8, 1, 2, 3]);
        let mut fds = FdList::default();
        assert!(matches!(
            parse_exec(&mut payload, &mut fds),
            Err(ProtocolError::Malformed)
        ));
    }

    #[test]
    fn missing_fd_is_malformed() {
        let mut payload = Payload::new(&[ExecCommand::Stdin as u8]);
        let mut fds = FdList::default();
        assert!(matches!(
            parse_exec(&mut payload, &mut fds),
            Err(ProtocolError::Malformed)
        ));
    }

    #[test]
    fn kill_message_layout() {
        let mut s = Serializer::request(RequestCommand::Kill);
        s.write_i32(7).unwrap();
        s.write_i32(15).unwrap();

        assert_eq!(s.payload()[0], RequestCommand::Kill as u8);
        let mut p = Payload::new(&s.payload()[1..]);
        assert_eq!(p.read_i32().unwrap(), 7);
        assert_eq!(p.read_i32().unwrap(), 15);
        assert!(p.is_empty());
    }
}
