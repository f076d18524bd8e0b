//! Namespace setup for sandboxed child processes.

use std::fmt::Write as _;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::CloneFlags;
use nix::unistd::{chdir, pivot_root, sethostname};

use super::config::SpawnConfig;
use super::mount::{Mount, bind_mount};
use super::uid_gid::UidGid;

/// Which namespaces to unshare and how to populate the new mount
/// namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceOptions {
    pub enable_user: bool,
    pub enable_pid: bool,
    pub enable_network: bool,
    pub enable_ipc: bool,
    pub enable_mount: bool,

    /// Mount a new `/proc`?
    pub mount_proc: bool,

    /// Pivot into this directory as the new root.
    pub pivot_root: Option<String>,

    /// The home directory (absolute path in the old root), bind
    /// mounted onto `mount_home`.
    pub home: Option<String>,

    /// Where to mount the home directory inside the new root.
    pub mount_home: Option<String>,

    /// Mount a tmpfs on `/tmp`, with these extra mount options (may
    /// be empty).
    pub mount_tmp_tmpfs: Option<String>,

    /// Mount a tmpfs on this path.
    pub mount_tmpfs: Option<String>,

    /// Ordered list of additional mounts.
    pub mounts: Vec<Mount>,

    /// A container-visible listener socket path the child expects to
    /// inherit (optionally followed by `NUL tag`).  Resolved into a
    /// bind-file mount by the listen-stream stock before spawning.
    pub mount_listen_stream: Option<String>,

    /// Set a hostname inside a new UTS namespace.
    pub hostname: Option<String>,
}

fn write_proc_file(path: &str, data: &str) -> std::io::Result<()> {
    std::fs::write(path, data)
}

fn setup_uid_map(uid: u32) -> std::io::Result<()> {
    write_proc_file("/proc/self/uid_map", &format!("{uid} {uid} 1"))
}

fn setup_gid_map(gid: u32) -> std::io::Result<()> {
    write_proc_file("/proc/self/gid_map", &format!("{gid} {gid} 1"))
}

/// Write "deny" to /proc/self/setgroups, which is necessary for
/// unprivileged processes to set up a gid_map.
fn deny_setgroups() {
    let _ = write_proc_file("/proc/self/setgroups", "deny");
}

impl NamespaceOptions {
    pub fn clone_flags(&self, config: &SpawnConfig) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.enable_user && !config.ignore_userns {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.enable_pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.enable_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.enable_mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.hostname.is_some() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        flags
    }

    /// Populate the new namespaces.  Runs in the child, after the
    /// clone and before dropping privileges.
    pub fn setup(&self, config: &SpawnConfig, uid_gid: &UidGid) -> std::io::Result<()> {
        /* set up UID/GID mapping in the old /proc */
        if self.enable_user && !config.ignore_userns {
            deny_setgroups();

            let ug = if !uid_gid.is_empty() {
                *uid_gid
            } else {
                config.default_uid_gid
            };

            if ug.gid != 0 {
                setup_gid_map(ug.gid)?;
            }

            setup_uid_map(ug.uid)?;
        }

        if self.enable_mount {
            /* convert all "shared" mounts to "private" mounts */
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_PRIVATE | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(io_context("failed to privatize mounts"))?;
        }

        let new_root = self.pivot_root.as_deref();
        let put_old = "mnt";

        if let Some(new_root) = new_root {
            /* first bind-mount the new root onto itself to "unlock"
               the kernel's mount object (MNT_LOCKED) in our
               namespace; without this, the kernel would not allow an
               unprivileged process to pivot_root to it */
            bind_mount(new_root, new_root, MsFlags::MS_NOSUID | MsFlags::MS_RDONLY)
                .map_err(io_context("failed to bind-mount the new root"))?;

            /* release a reference to the old root */
            chdir(new_root).map_err(io_context("chdir to new root failed"))?;

            /* enter the new root */
            pivot_root(new_root, put_old).map_err(io_context("pivot_root() failed"))?;
        }

        if self.mount_proc {
            mount(
                Some("none"),
                "/proc",
                Some("proc"),
                MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(io_context("failed to mount /proc"))?;
        }

        if self.mount_home.is_some() || !self.mounts.is_empty() {
            /* go to /mnt so we can refer to the old directories with
               a relative path */
            let path = if new_root.is_some() { "/mnt" } else { "/" };
            chdir(path).map_err(io_context("chdir failed"))?;
        }

        if let (Some(mount_home), Some(home)) = (&self.mount_home, &self.home) {
            let source = home.strip_prefix('/').unwrap_or(home);
            bind_mount(source, mount_home, MsFlags::MS_NOSUID | MsFlags::MS_NODEV)
                .map_err(io_context("failed to mount home directory"))?;
        }

        for m in &self.mounts {
            m.apply()
                .map_err(io_context("failed to apply mount"))?;
        }

        if new_root.is_some() && (self.mount_home.is_some() || !self.mounts.is_empty()) {
            /* back to the new root */
            chdir("/").map_err(io_context("chdir('/') failed"))?;
        }

        if new_root.is_some() {
            /* get rid of the old root */
            umount2(put_old, MntFlags::MNT_DETACH)
                .map_err(io_context("failed to detach the old root"))?;
        }

        if let Some(mount_tmpfs) = &self.mount_tmpfs {
            mount(
                Some("none"),
                mount_tmpfs.as_str(),
                Some("tmpfs"),
                MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
                Some("size=16M,nr_inodes=256,mode=700"),
            )
            .map_err(io_context("failed to mount tmpfs"))?;
        }

        if let Some(extra) = &self.mount_tmp_tmpfs {
            let mut options = String::from("size=16M,nr_inodes=256,mode=1777");
            if !extra.is_empty() {
                options.push(',');
                options.push_str(extra);
            }

            mount(
                Some("none"),
                "/tmp",
                Some("tmpfs"),
                MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
                Some(options.as_str()),
            )
            .map_err(io_context("failed to mount /tmp"))?;
        }

        if let Some(hostname) = &self.hostname {
            sethostname(hostname).map_err(io_context("sethostname() failed"))?;
        }

        Ok(())
    }

    pub fn make_id(&self, p: &mut String) {
        if self.enable_user {
            p.push_str(";uns");
        }
        if self.enable_pid {
            p.push_str(";pns");
        }
        if self.enable_network {
            p.push_str(";nns");
        }
        if self.enable_ipc {
            p.push_str(";ins");
        }

        if self.enable_mount {
            p.push_str(";mns");

            if let Some(pivot_root) = &self.pivot_root {
                write!(p, ";pvr={pivot_root}").expect("write to String cannot fail");
            }

            if self.mount_proc {
                p.push_str(";proc");
            }

            if let (Some(mount_home), Some(home)) = (&self.mount_home, &self.home) {
                write!(p, ";h:{home}={mount_home}").expect("write to String cannot fail");
            }

            if let Some(t) = &self.mount_tmp_tmpfs {
                write!(p, ";tt:{t}").expect("write to String cannot fail");
            }

            if let Some(t) = &self.mount_tmpfs {
                write!(p, ";t:{t}").expect("write to String cannot fail");
            }

            super::mount::mount_list_id(&self.mounts, p);

            if let Some(mls) = &self.mount_listen_stream {
                write!(p, ";mls={}", mls.replace('\0', ";")).expect("write to String cannot fail");
            }
        }

        if let Some(hostname) = &self.hostname {
            write!(p, ";uts={hostname}").expect("write to String cannot fail");
        }
    }
}

fn io_context(msg: &'static str) -> impl Fn(nix::Error) -> std::io::Error {
    move |errno| std::io::Error::new(std::io::Error::from(errno).kind(), msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_flags_follow_options() {
        let config = SpawnConfig::default();

        let mut ns = NamespaceOptions::default();
        assert!(ns.clone_flags(&config).is_empty());

        ns.enable_user = true;
        ns.enable_pid = true;
        ns.hostname = Some("sandbox".to_owned());
        let flags = ns.clone_flags(&config);
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn id_distinguishes_namespaces() {
        let mut a = NamespaceOptions::default();
        let mut id_a = String::new();
        a.make_id(&mut id_a);
        assert!(id_a.is_empty());

        a.enable_mount = true;
        a.pivot_root = Some("/srv/jail".to_owned());
        a.make_id(&mut id_a);
        assert_eq!(id_a, ";mns;pvr=/srv/jail");
    }
}
