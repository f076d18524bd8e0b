//! Command-line client for the Switchyard control plane.

use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};

use switchyard_core::control::{ControlClient, ControlCommand, ControlStats, DEFAULT_SOCKET};
use switchyard_core::translation::TranslationCommand;
use switchyard_core::translation::invalidate::encode_invalidate_pair;

#[derive(Parser, Debug)]
#[command(name = "switchyardctl", about = "Control a running Switchyard server")]
struct Args {
    /// Control socket address (`@name` for the abstract namespace).
    #[arg(long, default_value = DEFAULT_SOCKET)]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Liveness check.
    Nop,

    /// Adjust the server's log level (0..=4).
    Verbose { level: u8 },

    /// Invalidate translation-cache entries by KEY=VALUE filters.
    TcacheInvalidate { filters: Vec<String> },

    /// Re-enable a cluster node.
    EnableNode { name: String },

    /// Drain a cluster node.
    FadeNode { name: String },

    /// Query a cluster node's status.
    NodeStatus { name: String },

    /// Print the server's counters.
    Stats,

    /// Fade child processes, optionally only those with a tag.
    FadeChildren { tag: Option<String> },

    /// Flush the filter cache, optionally only entries with a tag.
    FlushFilterCache { tag: Option<String> },

    /// Log the pool tables.
    DumpPools,

    DisableZeroconf,
    EnableZeroconf,

    FlushNfsCache,

    /// Discard one session by its attach id.
    DiscardSession { attach_id: String },
}

const INVALIDATE_KEYS: &[(&str, TranslationCommand)] = &[
    ("URI", TranslationCommand::Uri),
    ("PARAM", TranslationCommand::Param),
    ("LISTENER_TAG", TranslationCommand::ListenerTag),
    ("REMOTE_HOST", TranslationCommand::RemoteHost),
    ("HOST", TranslationCommand::Host),
    ("LANGUAGE", TranslationCommand::Language),
    ("USER_AGENT", TranslationCommand::UserAgent),
    ("QUERY_STRING", TranslationCommand::QueryString),
    ("SITE", TranslationCommand::Site),
    ("INTERNAL_REDIRECT", TranslationCommand::InternalRedirect),
    ("ENOTDIR", TranslationCommand::Enotdir),
    ("USER", TranslationCommand::User),
];

fn parse_invalidate_filter(s: &str) -> anyhow::Result<Vec<u8>> {
    let (name, value) = s
        .split_once('=')
        .with_context(|| format!("missing '=': {s}"))?;

    if name.is_empty() {
        bail!("missing name: {s}");
    }

    for (key, command) in INVALIDATE_KEYS {
        if *key == name {
            return Ok(encode_invalidate_pair(*command, value));
        }
    }

    bail!("unrecognized key: '{name}'");
}

fn print_stats(stats: &ControlStats) {
    let print = |name: &str, value: u64| {
        if value != 0 {
            println!("{name} {value}");
        }
    };

    print("incoming_connections", u64::from(stats.incoming_connections));
    print("outgoing_connections", u64::from(stats.outgoing_connections));
    print("children", u64::from(stats.children));
    print("sessions", u64::from(stats.sessions));
    print("http_requests", stats.http_requests);
    print("translation_cache_size", stats.translation_cache_size);
    print("http_cache_size", stats.http_cache_size);
    print("filter_cache_size", stats.filter_cache_size);
    print("io_buffers_size", stats.io_buffers_size);
}

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let client = ControlClient::connect(&args.server)
        .with_context(|| format!("failed to connect to {}", args.server))?;

    match args.command {
        Command::Nop => client.send(ControlCommand::Nop, &[])?,

        Command::Verbose { level } => client.send(ControlCommand::Verbose, &[level])?,

        Command::TcacheInvalidate { filters } => {
            let mut payload = Vec::new();
            for filter in &filters {
                payload.extend_from_slice(&parse_invalidate_filter(filter)?);
            }
            client.send(ControlCommand::TcacheInvalidate, &payload)?;
        }

        Command::EnableNode { name } => {
            client.send(ControlCommand::EnableNode, name.as_bytes())?;
        }

        Command::FadeNode { name } => {
            client.send(ControlCommand::FadeNode, name.as_bytes())?;
        }

        Command::NodeStatus { name } => {
            client.auto_bind()?;
            client.send(ControlCommand::NodeStatus, name.as_bytes())?;

            let (command, payload) = client.receive(RESPONSE_TIMEOUT)?;
            if command != ControlCommand::NodeStatus {
                bail!("wrong response command");
            }

            let nul = payload
                .iter()
                .position(|&b| b == 0)
                .context("malformed response payload")?;
            println!("{}", String::from_utf8_lossy(&payload[nul + 1..]));
        }

        Command::Stats => {
            client.auto_bind()?;
            client.send(ControlCommand::Stats, &[])?;

            let (command, payload) = client.receive(RESPONSE_TIMEOUT)?;
            if command != ControlCommand::Stats {
                bail!("wrong response command");
            }

            print_stats(&ControlStats::parse(&payload));
        }

        Command::FadeChildren { tag } => {
            client.send(
                ControlCommand::FadeChildren,
                tag.as_deref().unwrap_or("").as_bytes(),
            )?;
        }

        Command::FlushFilterCache { tag } => {
            client.send(
                ControlCommand::FlushFilterCache,
                tag.as_deref().unwrap_or("").as_bytes(),
            )?;
        }

        Command::DumpPools => client.send(ControlCommand::DumpPools, &[])?,

        Command::DisableZeroconf => client.send(ControlCommand::DisableZeroconf, &[])?,
        Command::EnableZeroconf => client.send(ControlCommand::EnableZeroconf, &[])?,

        Command::FlushNfsCache => client.send(ControlCommand::FlushNfsCache, &[])?,

        Command::DiscardSession { attach_id } => {
            client.send(ControlCommand::DiscardSession, attach_id.as_bytes())?;
        }
    }

    Ok(())
}
