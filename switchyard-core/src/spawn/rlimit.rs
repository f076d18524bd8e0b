//! Resource limits applied to child processes.

use std::fmt::Write as _;

use crate::hash::{DJB_HASH_INIT, djb_hash};

/// Number of `RLIMIT_*` resources we track; matches the kernel's
/// `RLIM_NLIMITS`.
pub const RLIM_NLIMITS: usize = 16;

/// Sentinel for "not set, inherit the current value".
pub const RLIM_UNDEFINED: u64 = u64::MAX - 1;

pub const RLIM_INFINITY: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub cur: u64,
    pub max: u64,
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self {
            cur: RLIM_UNDEFINED,
            max: RLIM_UNDEFINED,
        }
    }
}

impl ResourceLimit {
    pub fn is_empty(&self) -> bool {
        self.cur == RLIM_UNDEFINED && self.max == RLIM_UNDEFINED
    }

    fn is_full(&self) -> bool {
        self.cur != RLIM_UNDEFINED && self.max != RLIM_UNDEFINED
    }
}

/// One `ResourceLimit` per resource index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub values: [ResourceLimit; RLIM_NLIMITS],
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(ResourceLimit::is_empty)
    }

    fn hash(&self) -> u32 {
        let mut hash = DJB_HASH_INIT;
        for v in &self.values {
            hash = djb_hash(&v.cur.to_le_bytes(), hash);
            hash = djb_hash(&v.max.to_le_bytes(), hash);
        }
        hash
    }

    pub fn make_id(&self, p: &mut String) {
        if self.is_empty() {
            return;
        }

        write!(p, ";r{:08x}", self.hash()).expect("write to String cannot fail");
    }

    /// Apply all limits with `setrlimit()`.  `RLIM_UNDEFINED` halves
    /// are completed from the current limit first.
    pub fn apply(&self) -> std::io::Result<()> {
        for (i, r) in self.values.iter().enumerate() {
            if r.is_empty() {
                continue;
            }

            let mut rlim = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };

            if !r.is_full() {
                let ret = unsafe { libc::getrlimit(i as _, &mut rlim) };
                if ret < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if r.cur != RLIM_UNDEFINED {
                rlim.rlim_cur = r.cur;
            }
            if r.max != RLIM_UNDEFINED {
                rlim.rlim_max = r.max;
            }

            let ret = unsafe { libc::setrlimit(i as _, &rlim) };
            if ret < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        Ok(())
    }

    /// Parse the translation server's compact rlimit syntax,
    /// e.g. `m100M` (RSS both limits), `Sv1G` (soft address space),
    /// `n!` (unlimited file descriptors).
    pub fn parse(&mut self, s: &str) -> bool {
        #[derive(Clone, Copy)]
        enum Which {
            Both,
            Soft,
            Hard,
        }

        let mut which = Which::Both;
        let mut chars = s.char_indices().peekable();

        while let Some((_, ch)) = chars.next() {
            let resource = match ch {
                'S' => {
                    which = Which::Soft;
                    continue;
                }
                'H' => {
                    which = Which::Hard;
                    continue;
                }
                't' => libc::RLIMIT_CPU,
                'f' => libc::RLIMIT_FSIZE,
                'd' => libc::RLIMIT_DATA,
                's' => libc::RLIMIT_STACK,
                'c' => libc::RLIMIT_CORE,
                'm' => libc::RLIMIT_RSS,
                'u' => libc::RLIMIT_NPROC,
                'n' => libc::RLIMIT_NOFILE,
                'l' => libc::RLIMIT_MEMLOCK,
                'v' => libc::RLIMIT_AS,
                'i' => libc::RLIMIT_SIGPENDING,
                'q' => libc::RLIMIT_MSGQUEUE,
                'e' => libc::RLIMIT_NICE,
                'r' => libc::RLIMIT_RTPRIO,
                _ => return false,
            } as usize;

            let value = if matches!(chars.peek(), Some((_, '!'))) {
                chars.next();
                RLIM_INFINITY
            } else {
                let mut value: u64 = 0;
                let mut digits = 0;
                while let Some(&(_, c)) = chars.peek() {
                    match c.to_digit(10) {
                        Some(d) => {
                            value = value * 10 + u64::from(d);
                            digits += 1;
                            chars.next();
                        }
                        None => break,
                    }
                }

                if digits == 0 {
                    return false;
                }

                match chars.peek() {
                    Some((_, 'G')) => {
                        value <<= 30;
                        chars.next();
                    }
                    Some((_, 'M')) => {
                        value <<= 20;
                        chars.next();
                    }
                    Some((_, 'K')) => {
                        value <<= 10;
                        chars.next();
                    }
                    _ => {}
                }

                value
            };

            let t = &mut self.values[resource];
            match which {
                Which::Both => {
                    t.cur = value;
                    t.max = value;
                }
                Which::Soft => t.cur = value,
                Which::Hard => t.max = value,
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_both() {
        let mut r = ResourceLimits::default();
        assert!(r.parse("m100M"));
        let v = &r.values[libc::RLIMIT_RSS as usize];
        assert_eq!(v.cur, 100 << 20);
        assert_eq!(v.max, 100 << 20);
    }

    #[test]
    fn parse_soft_hard() {
        let mut r = ResourceLimits::default();
        assert!(r.parse("Sv1GHv2G"));
        let v = &r.values[libc::RLIMIT_AS as usize];
        assert_eq!(v.cur, 1 << 30);
        assert_eq!(v.max, 2 << 30);
    }

    #[test]
    fn parse_unlimited() {
        let mut r = ResourceLimits::default();
        assert!(r.parse("n!"));
        let v = &r.values[libc::RLIMIT_NOFILE as usize];
        assert_eq!(v.cur, RLIM_INFINITY);
    }

    #[test]
    fn parse_garbage() {
        let mut r = ResourceLimits::default();
        assert!(!r.parse("zz"));
        assert!(!r.parse("m"));
    }

    #[test]
    fn id_empty() {
        let r = ResourceLimits::default();
        let mut id = String::new();
        r.make_id(&mut id);
        assert!(id.is_empty());
    }
}
