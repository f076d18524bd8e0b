//! Logging setup with a control-plane adjustable level.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, reload};

/// Handle for adjusting the log level at runtime (control `VERBOSE`).
#[derive(Clone)]
pub struct LogController {
    reload: reload::Handle<EnvFilter, tracing_subscriber::Registry>,

    stopwatch: Arc<Mutex<Option<OwnedFd>>>,
}

impl LogController {
    /// Map the control protocol's numeric level onto a filter.
    pub fn set_level(&self, level: u8) {
        let directive = match level {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        };

        match EnvFilter::try_new(directive) {
            Ok(filter) => {
                if self.reload.reload(filter).is_ok() {
                    info!(level, "log level changed");
                }
            }
            Err(_) => unreachable!("static filter directives always parse"),
        }
    }

    /// Keep the profiling pipe's write side; stopwatch lines go there
    /// until the peer closes it.
    pub fn attach_stopwatch(&self, pipe: OwnedFd) {
        *self.stopwatch.lock() = Some(pipe);
    }
}

/// Initialize tracing from `RUST_LOG` (default `info`) and return the
/// runtime controller.
pub fn init() -> LogController {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    LogController {
        reload: handle,
        stopwatch: Arc::new(Mutex::new(None)),
    }
}
