//! Options for launching a child process, as assembled from a
//! translation response.

use std::fmt::Write as _;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt as _;

use super::cgroup::CgroupOptions;
use super::namespace::NamespaceOptions;
use super::prepared::PreparedChildProcess;
use super::refence::RefenceOptions;
use super::rlimit::ResourceLimits;
use super::uid_gid::UidGid;
use crate::hash::djb_hash_string;

/// Everything that influences how a child process is sandboxed and
/// executed, minus the executable and its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildOptions {
    /// An absolute path where STDERR output will be appended.
    pub stderr_path: Option<String>,

    /// Environment variables (`NAME=value`).
    pub env: Vec<String>,

    pub cgroup: CgroupOptions,

    pub rlimits: ResourceLimits,

    pub refence: RefenceOptions,

    pub ns: NamespaceOptions,

    pub uid_gid: UidGid,

    /// Redirect STDERR to /dev/null?
    pub stderr_null: bool,

    pub no_new_privs: bool,

    /// CPU scheduler priority, -20..=19.
    pub priority: i32,

    /// NUL-separated tag list, matched by bulk-fade filters.
    pub tag: String,
}

impl ChildOptions {
    /// Append this options block's contribution to a child identity
    /// string.  The result is a pure function of the spawn
    /// parameters.
    pub fn make_id(&self, p: &mut String) {
        if let Some(stderr_path) = &self.stderr_path {
            write!(p, ";e{:08x}", djb_hash_string(stderr_path))
                .expect("write to String cannot fail");
        }

        for i in &self.env {
            p.push('$');
            p.push_str(i);
        }

        self.cgroup.make_id(p);
        self.rlimits.make_id(p);
        self.refence.make_id(p);
        self.ns.make_id(p);
        self.uid_gid.make_id(p);

        if self.no_new_privs {
            p.push_str(";nnp");
        }

        if self.priority != 0 {
            write!(p, ";pr{}", self.priority).expect("write to String cannot fail");
        }
    }

    /// Open the configured stderr file.
    pub fn open_stderr_path(&self) -> std::io::Result<OwnedFd> {
        let stderr_path = self
            .stderr_path
            .as_deref()
            .expect("open_stderr_path() without stderr_path");

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .mode(0o666)
            .open(stderr_path)?;
        Ok(file.into())
    }

    /// Copy these options into the spawn parameter tuple, opening the
    /// stderr file if one is configured.
    pub fn copy_to(&self, dest: &mut PreparedChildProcess) -> std::io::Result<()> {
        if self.stderr_path.is_some() {
            dest.stderr = Some(self.open_stderr_path()?);
        }

        for i in &self.env {
            dest.put_env(i);
        }

        dest.cgroup = self.cgroup.clone();
        dest.refence = self.refence.clone();
        dest.ns = self.ns.clone();
        dest.rlimits = self.rlimits.clone();
        dest.uid_gid = self.uid_gid;
        dest.no_new_privs = self.no_new_privs;
        dest.priority = self.priority;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic() {
        let mut options = ChildOptions::default();
        options.env.push("FOO=1".to_owned());
        options.ns.enable_user = true;

        let mut a = String::new();
        options.make_id(&mut a);
        let mut b = String::new();
        options.make_id(&mut b);
        assert_eq!(a, b);
        assert_eq!(a, "$FOO=1;uns");
    }

    #[test]
    fn env_order_matters() {
        let mut a = ChildOptions::default();
        a.env.push("A=1".to_owned());
        a.env.push("B=2".to_owned());

        let mut b = ChildOptions::default();
        b.env.push("B=2".to_owned());
        b.env.push("A=1".to_owned());

        let mut id_a = String::new();
        a.make_id(&mut id_a);
        let mut id_b = String::new();
        b.make_id(&mut id_b);
        assert_ne!(id_a, id_b);
    }
}
