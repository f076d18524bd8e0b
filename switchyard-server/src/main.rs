//! # Switchyard Server
//!
//! The Switchyard reverse-proxy engine: a single event-driven process
//! plus one privileged spawner sidecar.  Backend child processes are
//! pooled and sandboxed; per-request policy comes from an external
//! translation server.

/// Server configuration.
pub mod config;

/// Process-wide state.
pub mod instance;

/// Logging setup.
pub mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;

use switchyard_core::control::{ControlServer, bind_control_socket};
use switchyard_core::spawn::{detect_cgroup_state, launch_spawn_server};
use switchyard_core::{SpawnClient, TranslationService};

use crate::config::Config;
use crate::instance::Instance;
use crate::logging::LogController;

#[derive(Parser, Debug)]
#[command(name = "switchyard-server", about = "Reverse proxy and web accelerator")]
struct Args {
    /// Path of the configuration file.
    #[arg(long, default_value = "/etc/switchyard/server.toml")]
    config: PathBuf,

    /// Override the control socket address.
    #[arg(long)]
    control_listen: Option<String>,

    /// Override the translation server socket path.
    #[arg(long)]
    translation_socket: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log = logging::init();

    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };

    if let Some(control_listen) = args.control_listen {
        config.control_listen = control_listen;
    }
    if let Some(translation_socket) = args.translation_socket {
        config.translation_socket = translation_socket;
    }

    /* the sidecar must be forked before the runtime spins up worker
       threads, and before any privileges are dropped */
    let cgroup_state = detect_cgroup_state();
    let spawner_socket = launch_spawn_server(&config.spawn, cgroup_state)
        .context("failed to launch the spawner")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    runtime.block_on(async_main(config, spawner_socket, log))
}

async fn async_main(
    config: Config,
    spawner_socket: std::os::fd::OwnedFd,
    log: LogController,
) -> anyhow::Result<()> {
    let spawn_client = SpawnClient::new(spawner_socket, config.spawn.clone(), config.spawn_queue)
        .context("failed to set up the spawner client")?;

    let translation = Arc::new(TranslationService::new(&config.translation_socket));

    let instance = Instance::new(spawn_client, translation, config.stock_limit, log);

    let control_socket = bind_control_socket(&config.control_listen)
        .with_context(|| format!("failed to bind control socket {}", config.control_listen))?;
    let control_server = ControlServer::new(
        control_socket,
        Arc::clone(&instance) as Arc<dyn switchyard_core::control::ControlHandler>,
    )?;
    tokio::spawn(control_server.run());

    info!(
        control = %config.control_listen,
        translation = %config.translation_socket.display(),
        "switchyard up"
    );

    wait_for_shutdown().await;

    instance.shutdown();

    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term =
        signal(SignalKind::terminate()).expect("failed to install the SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install the SIGINT handler");

    tokio::select! {
        _ = term.recv() => info!("SIGTERM received"),
        _ = int.recv() => info!("SIGINT received"),
    }
}
