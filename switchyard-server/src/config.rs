//! Server configuration, loaded from a TOML file and overridable on
//! the command line.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use switchyard_core::SpawnConfig;

fn default_control_listen() -> String {
    switchyard_core::control::DEFAULT_SOCKET.to_owned()
}

fn default_translation_socket() -> PathBuf {
    PathBuf::from("/run/switchyard/translation.socket")
}

fn default_stock_limit() -> usize {
    2
}

fn default_spawn_queue() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The control socket address; `@name` selects the abstract
    /// namespace.
    pub control_listen: String,

    /// Path of the translation-server socket.
    pub translation_socket: PathBuf,

    /// Default per-key child limit where the translation response
    /// does not name one.
    pub stock_limit: usize,

    /// Bound on simultaneous spawn requests handed to the sidecar.
    pub spawn_queue: usize,

    pub spawn: SpawnConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_listen: default_control_listen(),
            translation_socket: default_translation_socket(),
            stock_limit: default_stock_limit(),
            spawn_queue: default_spawn_queue(),
            spawn: SpawnConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.control_listen, "@bp-control");
        assert_eq!(config.stock_limit, 2);
    }

    #[test]
    fn parse_toml() {
        let config: Config = toml::from_str(
            r#"
control_listen = "/run/switchyard/control.socket"
translation_socket = "/run/translation.socket"
stock_limit = 4

[spawn]
allowed_uids = [33]
allowed_gids = [33]
"#,
        )
        .expect("parse");

        assert_eq!(config.stock_limit, 4);
        assert_eq!(config.spawn.allowed_uids, [33]);
    }
}
