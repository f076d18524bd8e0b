//! Child stderr plumbing.
//!
//! A child's stderr goes to one of three places: a file opened at a
//! translation-provided path (`ChildOptions::open_stderr_path`), a
//! pipe read by the line-oriented `PrefixLogger`, or a datagram log
//! collector.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::unistd::pipe;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::info;

/// Size of the line buffer; longer lines are flushed with an inserted
/// newline so nothing is lost.
const BUFFER_SIZE: usize = 256;

/// Reads a child's stderr pipe line by line and re-emits every line
/// with a caller-set prefix (e.g. `"[pid=1234] "`).
pub struct PrefixLogger {
    fd: AsyncFd<OwnedFd>,

    buffer: [u8; BUFFER_SIZE],
    prefix_length: usize,
    line_length: usize,
}

impl PrefixLogger {
    /// Create the pipe; returns the logger (read side) and the write
    /// side for the child.
    pub fn create() -> std::io::Result<(Self, OwnedFd)> {
        let (read, write) = pipe().map_err(std::io::Error::from)?;
        set_nonblocking(&read)?;

        Ok((
            Self {
                fd: AsyncFd::new(read)?,
                buffer: [0; BUFFER_SIZE],
                prefix_length: 0,
                line_length: 0,
            },
            write,
        ))
    }

    pub fn set_prefix(&mut self, prefix: &str) {
        debug_assert_eq!(self.prefix_length, 0);
        debug_assert_eq!(self.line_length, 0);

        let n = std::cmp::min(prefix.len(), BUFFER_SIZE / 2);
        self.buffer[..n].copy_from_slice(&prefix.as_bytes()[..n]);
        self.prefix_length = n;
        self.line_length = n;
    }

    pub fn set_pid(&mut self, pid: i32) {
        self.set_prefix(&format!("[pid={pid}] "));
    }

    /// Pump the pipe until the peer closes it.
    pub async fn run(mut self) {
        loop {
            let Ok(mut guard) = self.fd.ready(Interest::READABLE).await else {
                return;
            };

            /* reserve 1 byte for the newline inserted into overlong
               lines */
            let start = self.line_length;
            let room = BUFFER_SIZE - start - 1;

            let mut chunk = [0u8; BUFFER_SIZE];
            match nix::unistd::read(self.fd.get_ref().as_raw_fd(), &mut chunk[..room]) {
                Ok(0) => return,
                Ok(n) => {
                    self.buffer[start..start + n].copy_from_slice(&chunk[..n]);
                    self.line_length += n;
                    while self.consume_line() {}
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready_matching(tokio::io::Ready::READABLE);
                }
                Err(_) => return,
            }
        }
    }

    /// Emit one complete line, or force a flush when the buffer is
    /// full.  Returns whether a line was emitted.
    fn consume_line(&mut self) -> bool {
        let haystack = &self.buffer[self.prefix_length..self.line_length];
        let length = match haystack.iter().position(|&b| b == b'\n') {
            Some(newline) => self.prefix_length + newline + 1,
            None => {
                if self.line_length < BUFFER_SIZE - 1 {
                    return false;
                }

                /* overlong line: insert a newline and flush */
                self.buffer[self.line_length] = b'\n';
                self.line_length += 1;
                self.line_length
            }
        };

        emit(&self.buffer[..length]);

        /* move the remainder up, right after the prefix */
        self.buffer
            .copy_within(length..self.line_length, self.prefix_length);
        self.line_length -= length - self.prefix_length;

        debug_assert!(self.line_length >= self.prefix_length);

        true
    }
}

fn emit(line: &[u8]) {
    let line = String::from_utf8_lossy(line);
    info!(target: "child_stderr", "{}", line.trim_end_matches('\n'));
}

/// Forwards child stderr lines to a datagram log collector.
pub struct DatagramLogSink {
    socket: OwnedFd,
}

impl DatagramLogSink {
    /// Connect to the collector socket (a path, or `@name` for the
    /// abstract namespace).
    pub fn open(address: &str) -> std::io::Result<Self> {
        use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, connect, socket};

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
            UnixAddr::new(address).map_err(std::io::Error::from)?
        };

        connect(fd.as_raw_fd(), &addr).map_err(std::io::Error::from)?;

        Ok(Self { socket: fd })
    }

    /// Send one log line; a full collector queue drops the line
    /// rather than stalling the reader.
    pub fn send(&self, line: &[u8]) {
        let _ = nix::sys::socket::send(
            self.socket.as_raw_fd(),
            line,
            nix::sys::socket::MsgFlags::MSG_DONTWAIT,
        );
    }

    /// Create a stderr pipe whose lines are streamed to the
    /// collector; returns the write side for the child.
    pub fn pipe_adapter(self) -> std::io::Result<OwnedFd> {
        let (read, write) = pipe().map_err(std::io::Error::from)?;
        set_nonblocking(&read)?;

        let fd = AsyncFd::new(read)?;
        tokio::spawn(async move {
            let mut buffer = [0u8; 4096];
            let mut fill = 0usize;

            loop {
                let Ok(mut guard) = fd.ready(Interest::READABLE).await else {
                    return;
                };

                match nix::unistd::read(fd.get_ref().as_raw_fd(), &mut buffer[fill..]) {
                    Ok(0) => return,
                    Ok(n) => {
                        fill += n;

                        let mut start = 0;
                        while let Some(pos) = buffer[start..fill].iter().position(|&b| b == b'\n')
                        {
                            self.send(&buffer[start..start + pos]);
                            start += pos + 1;
                        }

                        buffer.copy_within(start..fill, 0);
                        fill -= start;

                        if fill == buffer.len() {
                            /* overlong line: ship it as-is */
                            self.send(&buffer[..fill]);
                            fill = 0;
                        }
                    }
                    Err(nix::errno::Errno::EAGAIN) => {
                        guard.clear_ready_matching(tokio::io::Ready::READABLE);
                    }
                    Err(_) => return,
                }
            }
        });

        Ok(write)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_lines(logger: &mut PrefixLogger, input: &[u8]) -> Vec<String> {
        /* drive consume_line() directly for deterministic tests */
        let mut lines = Vec::new();
        for &b in input {
            if logger.line_length < BUFFER_SIZE - 1 {
                logger.buffer[logger.line_length] = b;
                logger.line_length += 1;
            }

            while logger.line_length > logger.prefix_length {
                let before = logger.line_length;
                let haystack = &logger.buffer[logger.prefix_length..logger.line_length];
                let Some(newline) = haystack.iter().position(|&b| b == b'\n') else {
                    break;
                };

                let length = logger.prefix_length + newline + 1;
                lines.push(
                    String::from_utf8_lossy(&logger.buffer[..length])
                        .trim_end()
                        .to_owned(),
                );
                logger
                    .buffer
                    .copy_within(length..logger.line_length, logger.prefix_length);
                logger.line_length -= length - logger.prefix_length;
                assert!(logger.line_length < before);
            }
        }
        lines
    }

    #[tokio::test]
    async fn prefix_is_prepended() {
        let (mut logger, _write) = PrefixLogger::create().expect("create");
        logger.set_pid(1234);

        let lines = collect_lines(&mut logger, b"hello\nworld\n");
        assert_eq!(lines, ["[pid=1234] hello", "[pid=1234] world"]);
    }

    #[tokio::test]
    async fn partial_line_is_buffered() {
        let (mut logger, _write) = PrefixLogger::create().expect("create");
        logger.set_prefix("x: ");

        let lines = collect_lines(&mut logger, b"par");
        assert!(lines.is_empty());
        assert_eq!(logger.line_length, logger.prefix_length + 3);
    }
}
