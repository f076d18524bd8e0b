//! # Switchyard Core
//!
//! The engine room of the Switchyard reverse proxy: reusable pools of
//! sandboxed child processes, the privilege-separated spawner that
//! starts them, and the resource-address algebra that decides which
//! backend serves a request.
//!
//! ## Overview
//!
//! - **Process-pool stocks**: keyed, bounded pools of child processes
//!   reached over per-child UNIX sockets, with parallelism and
//!   concurrency limits, idle expiry and bulk fade
//! - **Spawner sidecar**: a separate process performing the
//!   clone()/execve() work behind a datagram protocol, applying
//!   namespaces, mounts, rlimits, uid/gid and cgroup placement
//! - **Resource addresses**: the typed sum of backend descriptions
//!   produced by the translation server, plus the base/rewriting
//!   algebra the cache is built on
//! - **Translation client**: marshals request descriptors and parses
//!   the length-prefixed response stream
//! - **Control plane**: the datagram protocol behind `switchyardctl`

/// The resource-address model and its algebra.
pub mod address;

/// The control-plane wire protocol and server.
pub mod control;

/// Stock keys and identifier hashing.
pub mod hash;

/// LHTTP child processes (HTTP/1.1 over private AF_LOCAL sockets).
pub mod lhttp;

/// On-demand listener sockets backed by translation lookups.
pub mod listen_stream;

/// Temporary listener sockets.
pub mod net;

/// Spawning sandboxed child processes.
pub mod spawn;

/// Generic keyed pools.
pub mod stock;

/// NUL-separated tag lists.
pub mod string_list;

/// The translation-server client.
pub mod translation;

/// URI string algebra.
pub mod uri;

/// WAS child processes and their stocks.
pub mod was;

/// Child stderr plumbing.
pub mod access_log;

pub use address::{AddressError, ResourceAddress};
pub use hash::StringWithHash;
pub use spawn::{ChildOptions, SpawnClient, SpawnConfig, SpawnError};
pub use translation::{TranslateRequest, TranslateResponse, TranslationService};
