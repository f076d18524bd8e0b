//! The resolved spawn parameter tuple sent to the spawner.

use std::os::fd::OwnedFd;

use super::cgroup::CgroupOptions;
use super::namespace::NamespaceOptions;
use super::refence::RefenceOptions;
use super::rlimit::ResourceLimits;
use super::uid_gid::UidGid;

pub const MAX_ARGS: usize = 32;
pub const MAX_ENV: usize = 32;

/// Everything the spawner needs to start one child process.  File
/// descriptors are owned here and transferred via `SCM_RIGHTS`.
#[derive(Debug, Default)]
pub struct PreparedChildProcess {
    pub args: Vec<String>,
    pub env: Vec<String>,

    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,

    /// The backend-specific control channel, passed as fd 3.
    pub control: Option<OwnedFd>,

    /// The CPU scheduler priority configured with setpriority(),
    /// ranging from -20 to 19.
    pub priority: i32,

    pub cgroup: CgroupOptions,

    pub refence: RefenceOptions,

    pub ns: NamespaceOptions,

    pub rlimits: ResourceLimits,

    pub uid_gid: UidGid,

    /// Change to this new root directory.  Deprecated in favor of
    /// `ns.pivot_root`; kept for compatibility.
    pub chroot: Option<String>,

    pub no_new_privs: bool,
}

impl PreparedChildProcess {
    pub fn append(&mut self, arg: &str) -> bool {
        if self.args.len() + 1 >= MAX_ARGS {
            return false;
        }

        self.args.push(arg.to_owned());
        true
    }

    pub fn put_env(&mut self, pair: &str) -> bool {
        if self.env.len() + 1 >= MAX_ENV {
            return false;
        }

        self.env.push(pair.to_owned());
        true
    }

    pub fn set_env(&mut self, name: &str, value: &str) -> bool {
        self.put_env(&format!("{name}={value}"))
    }

    /// Prepend a wrapper (e.g. an interpreter) in front of the
    /// argument list.
    pub fn insert_wrapper(&mut self, wrapper: &[&str]) -> bool {
        if self.args.len() + wrapper.len() >= MAX_ARGS {
            return false;
        }

        for (i, w) in wrapper.iter().enumerate() {
            self.args.insert(i, (*w).to_owned());
        }
        true
    }

    /// Finish this object and return the executable path.  The first
    /// argument is reduced to its basename for the child's argv[0].
    pub fn finish(&mut self) -> String {
        let path = self.args.first().cloned().unwrap_or_default();

        if let Some(slash) = path.rfind('/')
            && slash + 1 < path.len()
        {
            self.args[0] = path[slash + 1..].to_owned();
        }

        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_strips_directory() {
        let mut p = PreparedChildProcess::default();
        assert!(p.append("/usr/bin/app"));
        assert!(p.append("--flag"));

        let path = p.finish();
        assert_eq!(path, "/usr/bin/app");
        assert_eq!(p.args[0], "app");
    }

    #[test]
    fn wrapper_goes_first() {
        let mut p = PreparedChildProcess::default();
        assert!(p.append("/srv/app.cgi"));
        assert!(p.insert_wrapper(&["/usr/bin/python3"]));
        assert_eq!(p.args, ["/usr/bin/python3", "/srv/app.cgi"]);
    }

    #[test]
    fn arg_limit() {
        let mut p = PreparedChildProcess::default();
        for i in 0..MAX_ARGS - 1 {
            assert!(p.append(&format!("a{i}")));
        }
        assert!(!p.append("one-too-many"));
    }
}
