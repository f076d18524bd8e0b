//! Control-group placement for child processes.

use std::io::Write as _;
use std::path::PathBuf;

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";

/// The cgroup a child process is moved into, plus optional attribute
/// assignments (`memory.max` and friends).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupOptions {
    /// Name of the sub-cgroup below the delegated group, or `None`
    /// for no cgroup placement.
    pub name: Option<String>,

    /// `(attribute, value)` pairs written into the new cgroup.
    pub set: Vec<(String, String)>,
}

/// The delegated cgroup the spawner is allowed to create sub-groups
/// in, discovered at startup.
#[derive(Debug, Clone, Default)]
pub struct CgroupState {
    /// The group path below the mount point (e.g.
    /// `/system.slice/switchyard.service`), empty when cgroups are
    /// unavailable.
    pub group_path: String,
}

impl CgroupState {
    pub fn is_enabled(&self) -> bool {
        !self.group_path.is_empty()
    }
}

impl CgroupOptions {
    pub fn make_id(&self, p: &mut String) {
        if let Some(name) = &self.name {
            p.push_str(";cg");
            p.push_str(name);

            for (k, v) in &self.set {
                p.push_str(";cs");
                p.push_str(k);
                p.push('=');
                p.push_str(v);
            }
        }
    }

    /// Create the sub-cgroup, apply the attribute assignments and
    /// move the calling process into it.  Only called in the child
    /// between clone and exec.
    pub fn apply(&self, state: &CgroupState) -> std::io::Result<()> {
        let Some(name) = &self.name else {
            return Ok(());
        };

        if !state.is_enabled() {
            return Err(std::io::Error::other("control groups are disabled"));
        }

        let mut path = PathBuf::from(CGROUP_MOUNT);
        path.push(state.group_path.trim_start_matches('/'));
        path.push(name);

        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        for (attribute, value) in &self.set {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(path.join(attribute))?;
            f.write_all(value.as_bytes())?;
        }

        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .open(path.join("cgroup.procs"))?;
        f.write_all(b"0")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id() {
        let mut opts = CgroupOptions::default();
        let mut id = String::new();
        opts.make_id(&mut id);
        assert!(id.is_empty());

        opts.name = Some("workers".to_owned());
        opts.set.push(("memory.max".to_owned(), "64M".to_owned()));
        opts.make_id(&mut id);
        assert_eq!(id, ";cgworkers;csmemory.max=64M");
    }
}
