//! Spawning sandboxed child processes through the privilege-separated
//! spawner sidecar.

pub mod cgroup;
pub mod child_options;
pub mod child_stock;
pub mod client;
pub mod config;
pub mod launch;
pub mod mount;
pub mod namespace;
pub mod prepared;
pub mod protocol;
pub mod refence;
pub mod registry;
pub mod rlimit;
pub mod server;
pub mod uid_gid;

pub use child_options::ChildOptions;
pub use client::{ChildHandle, ExitListener, SpawnClient, SpawnError};
pub use config::SpawnConfig;
pub use launch::{detect_cgroup_state, launch_spawn_server};
pub use prepared::PreparedChildProcess;
