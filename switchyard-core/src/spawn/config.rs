//! Spawner configuration.

use serde::Deserialize;

use super::uid_gid::UidGid;

/// Configuration for the spawner sidecar, shared by the client (for
/// early diagnostics) and the sidecar itself (authoritative).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// uids child processes may be switched to.  An empty list allows
    /// any uid.
    pub allowed_uids: Vec<u32>,

    /// gids child processes may be switched to.  An empty list allows
    /// any gid.
    pub allowed_gids: Vec<u32>,

    /// Credentials applied when a request does not name any, e.g. for
    /// the uid/gid mapping of a new user namespace.
    #[serde(skip)]
    pub default_uid_gid: UidGid,

    /// Skip user namespaces even when requested (for kernels or
    /// containers where they are unavailable).
    pub ignore_userns: bool,
}

impl SpawnConfig {
    /// May a child process run with these credentials?
    pub fn verify(&self, uid_gid: &UidGid) -> bool {
        self.verify_uid(uid_gid.uid)
            && self.verify_gid(uid_gid.gid)
            && uid_gid.groups[..uid_gid.count_groups()]
                .iter()
                .all(|&gid| self.verify_gid(gid))
    }

    fn verify_uid(&self, uid: u32) -> bool {
        self.allowed_uids.is_empty() || self.allowed_uids.contains(&uid)
    }

    fn verify_gid(&self, gid: u32) -> bool {
        self.allowed_gids.is_empty() || self.allowed_gids.contains(&gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_all() {
        let config = SpawnConfig::default();
        let ug = UidGid {
            uid: 1234,
            gid: 1234,
            ..Default::default()
        };
        assert!(config.verify(&ug));
    }

    #[test]
    fn allow_list_is_enforced() {
        let config = SpawnConfig {
            allowed_uids: vec![100, 101],
            allowed_gids: vec![100],
            ..Default::default()
        };

        let ok = UidGid {
            uid: 100,
            gid: 100,
            ..Default::default()
        };
        assert!(config.verify(&ok));

        let bad_uid = UidGid {
            uid: 102,
            gid: 100,
            ..Default::default()
        };
        assert!(!config.verify(&bad_uid));

        let mut bad_group = ok;
        bad_group.groups[0] = 999;
        assert!(!config.verify(&bad_group));
    }
}
