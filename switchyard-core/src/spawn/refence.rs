//! Refence authorization tokens written to the kernel before exec.

use std::fmt::Write as _;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt as _;

use crate::hash::{DJB_HASH_INIT, djb_hash};

const REFENCE_PATH: &str = "/proc/cm4all/refence/self";

/// An opaque NUL-separated token list written to
/// `/proc/cm4all/refence/self` to mark the sandboxed process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefenceOptions {
    data: Vec<u8>,
}

impl RefenceOptions {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self) -> &[u8] {
        &self.data
    }

    pub fn set(&mut self, data: &[u8]) {
        self.data = data.to_vec();
    }

    fn hash(&self) -> u32 {
        djb_hash(&self.data, DJB_HASH_INIT)
    }

    pub fn make_id(&self, p: &mut String) {
        if !self.is_empty() {
            write!(p, ";rf{:08x}", self.hash()).expect("write to String cannot fail");
        }
    }

    /// Write the token list.  Only called in the child between clone
    /// and exec.
    pub fn apply(&self) -> std::io::Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open(REFENCE_PATH)?;

        for token in self.data.split(|&b| b == 0) {
            f.write_all(token)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_reflects_data() {
        let mut r = RefenceOptions::default();
        let mut id = String::new();
        r.make_id(&mut id);
        assert!(id.is_empty());

        r.set(b"token");
        r.make_id(&mut id);
        assert!(id.starts_with(";rf"));
        assert_eq!(id.len(), ";rf".len() + 8);
    }
}
