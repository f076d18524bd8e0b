//! The mount list applied inside a child's mount namespace.

use std::fmt::Write as _;

use nix::mount::{MsFlags, mount};

use crate::hash::djb_hash_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    /// Bind-mount a directory.
    Bind,

    /// Bind-mount a single file (e.g. a listener socket inherited
    /// from the listen-stream stock).
    BindFile,

    /// Mount a fresh tmpfs on the target.
    Tmpfs,
}

/// One entry of the ordered mount list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Source path, relative to the old root (no leading slash) for
    /// bind mounts.
    pub source: String,

    /// Absolute target path inside the new root.
    pub target: String,

    pub mount_type: MountType,

    pub writable: bool,

    /// Omit `MS_NOEXEC`?
    pub exec: bool,
}

impl Mount {
    pub fn bind(source: &str, target: &str, writable: bool, exec: bool) -> Self {
        Self {
            source: source.to_owned(),
            target: target.to_owned(),
            mount_type: MountType::Bind,
            writable,
            exec,
        }
    }

    pub fn bind_file(source: &str, target: &str) -> Self {
        Self {
            source: source.to_owned(),
            target: target.to_owned(),
            mount_type: MountType::BindFile,
            writable: true,
            exec: false,
        }
    }

    /// Apply this mount.  Only called inside the freshly unshared
    /// mount namespace, between `pivot_root` preparation steps.
    pub fn apply(&self) -> nix::Result<()> {
        match self.mount_type {
            MountType::Bind | MountType::BindFile => {
                let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
                if !self.writable {
                    flags |= MsFlags::MS_RDONLY;
                }
                if !self.exec {
                    flags |= MsFlags::MS_NOEXEC;
                }

                bind_mount(&self.source, &self.target, flags)
            }

            MountType::Tmpfs => mount(
                Some("none"),
                self.target.as_str(),
                Some("tmpfs"),
                MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
                Some("size=16M,nr_inodes=256,mode=700"),
            ),
        }
    }

    fn append_id(&self, p: &mut String) {
        match self.mount_type {
            MountType::Bind => write!(p, ";m:{}={}", self.source, self.target),
            MountType::BindFile => write!(p, ";mf:{}={}", self.source, self.target),
            MountType::Tmpfs => write!(p, ";mt:{}", self.target),
        }
        .expect("write to String cannot fail");

        if self.writable {
            p.push_str(";w");
        }
        if self.exec {
            p.push_str(";x");
        }
    }
}

/// Bind-mount `source` onto `target`.  A bind mount needs a second
/// `mount()` call to apply the read-only/noexec flags.
pub fn bind_mount(source: &str, target: &str, flags: MsFlags) -> nix::Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;

    mount(
        None::<&str>,
        target,
        None::<&str>,
        flags | MsFlags::MS_REMOUNT | MsFlags::MS_BIND,
        None::<&str>,
    )
}

/// Append the mount list's contribution to a child identity string.
pub fn mount_list_id(mounts: &[Mount], p: &mut String) {
    for m in mounts {
        m.append_id(p);
    }
}

/// A short stable digest of the mount list, used where the full list
/// would make the id unwieldy.
pub fn mount_list_hash(mounts: &[Mount]) -> u32 {
    let mut id = String::new();
    mount_list_id(mounts, &mut id);
    djb_hash_string(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_reflects_order() {
        let a = vec![Mount::bind("a", "/a", false, false), Mount::bind("b", "/b", true, false)];
        let b = vec![Mount::bind("b", "/b", true, false), Mount::bind("a", "/a", false, false)];
        assert_ne!(mount_list_hash(&a), mount_list_hash(&b));
    }
}
