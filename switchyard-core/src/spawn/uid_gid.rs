//! Credential switching for child processes.

use std::fmt::Write as _;

use nix::unistd::{Gid, Uid, setgroups, setresgid, setresuid};

pub const MAX_GROUPS: usize = 32;

/// The uid/gid (and supplementary groups) a child process is switched
/// to before exec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UidGid {
    pub uid: u32,
    pub gid: u32,

    /// Supplementary group ids, terminated by the first zero entry.
    pub groups: [u32; MAX_GROUPS],
}

impl UidGid {
    pub fn is_empty(&self) -> bool {
        self.uid == 0 && self.gid == 0 && !self.has_groups()
    }

    pub fn has_groups(&self) -> bool {
        self.groups[0] != 0
    }

    pub fn count_groups(&self) -> usize {
        self.groups.iter().take_while(|&&g| g != 0).count()
    }

    pub fn effective() -> Self {
        Self {
            uid: Uid::effective().as_raw(),
            gid: Gid::effective().as_raw(),
            groups: [0; MAX_GROUPS],
        }
    }

    pub fn make_id(&self, p: &mut String) {
        if self.uid != 0 {
            write!(p, ";uid{}", self.uid).expect("write to String cannot fail");
        }

        if self.gid != 0 {
            write!(p, ";gid{}", self.gid).expect("write to String cannot fail");
        }
    }

    /// Drop privileges: supplementary groups first, then gid, then
    /// uid.  Only called in the child between clone and exec.
    pub fn apply(&self) -> nix::Result<()> {
        if self.gid != 0 {
            let gid = Gid::from_raw(self.gid);
            setresgid(gid, gid, gid)?;
        }

        if self.has_groups() {
            let groups: Vec<Gid> = self.groups[..self.count_groups()]
                .iter()
                .map(|&g| Gid::from_raw(g))
                .collect();
            setgroups(&groups)?;
        } else if self.gid != 0 {
            setgroups(&[])?;
        }

        if self.uid != 0 {
            let uid = Uid::from_raw(self.uid);
            setresuid(uid, uid, uid)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert!(UidGid::default().is_empty());

        let ug = UidGid {
            uid: 1000,
            ..Default::default()
        };
        assert!(!ug.is_empty());
    }

    #[test]
    fn test_id() {
        let ug = UidGid {
            uid: 33,
            gid: 33,
            ..Default::default()
        };
        let mut id = String::new();
        ug.make_id(&mut id);
        assert_eq!(id, ";uid33;gid33");
    }

    #[test]
    fn test_count_groups() {
        let mut ug = UidGid::default();
        assert_eq!(ug.count_groups(), 0);
        ug.groups[0] = 100;
        ug.groups[1] = 101;
        assert_eq!(ug.count_groups(), 2);
    }
}
