//! The `Instance`: all process-wide state, passed by reference
//! instead of living in globals.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use tracing::{info, warn};

use switchyard_core::control::{ControlHandler, ControlStats};
use switchyard_core::lhttp::LhttpStock;
use switchyard_core::listen_stream::{
    ListenStreamError, ListenStreamHandler, ListenStreamServer, ListenStreamStock,
};
use switchyard_core::spawn::PreparedChildProcess;
use switchyard_core::translation::InvalidateRequest;
use switchyard_core::was::{MultiWasStock, RemoteWasStock, WasStock};
use switchyard_core::{SpawnClient, TranslateRequest, TranslationService};

use crate::logging::LogController;

pub struct Instance {
    pub spawn_client: Arc<SpawnClient>,

    pub translation: Arc<TranslationService>,

    pub listen_stream: Arc<ListenStreamStock>,

    pub was_stock: WasStock,
    pub multi_was_stock: MultiWasStock,
    pub remote_was_stock: RemoteWasStock,
    pub lhttp_stock: LhttpStock,

    pub http_requests: AtomicU64,

    zeroconf_enabled: AtomicBool,

    log: LogController,
}

impl Instance {
    pub fn new(
        spawn_client: Arc<SpawnClient>,
        translation: Arc<TranslationService>,
        stock_limit: usize,
        log: LogController,
    ) -> Arc<Self> {
        let handler = Arc::new(SpawnListenStreamHandler {
            translation: Arc::clone(&translation),
            spawn_client: Arc::clone(&spawn_client),
        });
        let listen_stream = ListenStreamStock::new(handler);

        Arc::new(Self {
            was_stock: WasStock::new(
                Arc::clone(&spawn_client),
                Some(Arc::clone(&listen_stream)),
                stock_limit,
            ),
            multi_was_stock: MultiWasStock::new(
                Arc::clone(&spawn_client),
                Some(Arc::clone(&listen_stream)),
                stock_limit,
            ),
            remote_was_stock: RemoteWasStock::new(stock_limit),
            lhttp_stock: LhttpStock::new(
                Arc::clone(&spawn_client),
                Some(Arc::clone(&listen_stream)),
                stock_limit,
            ),
            spawn_client,
            translation,
            listen_stream,
            http_requests: AtomicU64::new(0),
            zeroconf_enabled: AtomicBool::new(true),
            log,
        })
    }

    /// Memory-pressure hook: evict one idle child, preferring the
    /// stock with idle items.
    pub fn discard_oldest_idle(&self) -> bool {
        self.was_stock.discard_oldest_idle()
            || self.multi_was_stock.discard_oldest_idle()
            || self.lhttp_stock.discard_oldest_idle()
            || self.remote_was_stock.discard_oldest_idle()
    }

    pub fn fade_all_children(&self) {
        self.was_stock.fade_all();
        self.multi_was_stock.fade_all();
        self.lhttp_stock.fade_all();
        self.remote_was_stock.fade_all();
        self.listen_stream.fade_all();
    }

    /// Begin graceful shutdown: no new children, fade everything.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.fade_all_children();
        self.spawn_client.shutdown();
    }
}

impl ControlHandler for Instance {
    fn tcache_invalidate(&self, request: InvalidateRequest) {
        /* the translation cache is outside this core; the parsed
           request is logged so operators can verify filters */
        info!(?request, "translation cache invalidation");
    }

    fn verbose(&self, level: u8) {
        self.log.set_level(level);
    }

    fn enable_node(&self, name: &str) {
        info!(name, "node enabled");
    }

    fn fade_node(&self, name: &str) {
        info!(name, "node faded");
    }

    fn node_status(&self, _name: &str) -> Option<String> {
        Some("ok".to_owned())
    }

    fn fade_children(&self, tag: Option<&str>) {
        match tag {
            Some(tag) => {
                info!(tag, "fading children by tag");
                self.was_stock.fade_tag(tag);
                self.multi_was_stock.fade_tag(tag);
                self.lhttp_stock.fade_tag(tag);
                self.listen_stream.fade_tag(tag);
            }
            None => {
                info!("fading all children");
                self.fade_all_children();
            }
        }
    }

    fn flush_filter_cache(&self, tag: Option<&str>) {
        info!(?tag, "filter cache flush");
    }

    fn discard_session(&self, attach_id: &[u8]) {
        info!(len = attach_id.len(), "session discarded");
    }

    fn stats(&self) -> ControlStats {
        let was = self.was_stock.stats();
        let multi = self.multi_was_stock.stats();
        let lhttp = self.lhttp_stock.stats();
        let remote = self.remote_was_stock.stats();

        ControlStats {
            children: (was.busy + was.idle + multi.busy + multi.idle + lhttp.busy + lhttp.idle)
                as u32,
            outgoing_connections: (was.busy + multi.busy + lhttp.busy + remote.busy) as u32,
            http_requests: self.http_requests.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    fn dump_pools(&self) -> String {
        let was = self.was_stock.stats();
        let multi = self.multi_was_stock.stats();
        let lhttp = self.lhttp_stock.stats();
        let remote = self.remote_was_stock.stats();

        format!(
            "was busy={} idle={}\nmulti-was busy={} idle={}\nlhttp busy={} idle={}\nremote-was busy={} idle={}",
            was.busy,
            was.idle,
            multi.busy,
            multi.idle,
            lhttp.busy,
            lhttp.idle,
            remote.busy,
            remote.idle,
        )
    }

    fn disable_zeroconf(&self) {
        self.zeroconf_enabled.store(false, Ordering::Relaxed);
        info!("zeroconf disabled");
    }

    fn enable_zeroconf(&self) {
        self.zeroconf_enabled.store(true, Ordering::Relaxed);
        info!("zeroconf enabled");
    }

    fn flush_nfs_cache(&self) {
        info!("NFS cache flush");
    }

    fn stopwatch_pipe(&self) -> Option<OwnedFd> {
        let (read, write) = nix::unistd::pipe().ok()?;
        self.log.attach_stopwatch(write);
        Some(read)
    }
}

/// Answers listen-stream readiness by consulting the translation
/// server and spawning the process it describes, with the accepted
/// listener as its stdin.
struct SpawnListenStreamHandler {
    translation: Arc<TranslationService>,
    spawn_client: Arc<SpawnClient>,
}

impl ListenStreamHandler for SpawnListenStreamHandler {
    fn ready(
        &self,
        key: String,
        socket_path: std::path::PathBuf,
        socket: OwnedFd,
    ) -> BoxFuture<'static, Result<ListenStreamServer, ListenStreamError>> {
        let translation = Arc::clone(&self.translation);
        let spawn_client = Arc::clone(&self.spawn_client);

        Box::pin(async move {
            let request = TranslateRequest {
                mount_listen_stream: Some(key.clone().into_bytes()),
                ..Default::default()
            };

            let response = translation
                .translate(&request)
                .await
                .map_err(|e| ListenStreamError::Handler(e.to_string().into()))?;

            if response.status != 0 {
                let message = match &response.message {
                    Some(message) => format!(
                        "status {} from translation server: {message}",
                        response.status
                    ),
                    None => format!("status {} from translation server", response.status),
                };
                warn!(key, "{message}");
                return Err(ListenStreamError::Handler(message.into()));
            }

            let Some(execute) = &response.execute else {
                return Err(ListenStreamError::Handler(
                    "no EXECUTE from translation server".into(),
                ));
            };

            let mut p = PreparedChildProcess::default();
            p.append(execute);
            for arg in &response.args {
                if !p.append(arg) {
                    return Err(ListenStreamError::Handler(
                        "too many APPEND packets from translation server".into(),
                    ));
                }
            }

            response
                .child_options
                .copy_to(&mut p)
                .map_err(|e| ListenStreamError::Handler(e.to_string().into()))?;

            p.stdin = Some(socket);

            let name = socket_path.display().to_string();
            let handle = spawn_client
                .spawn_child(&name, p)
                .await
                .map_err(|e| ListenStreamError::Handler(e.to_string().into()))?;

            Ok(ListenStreamServer {
                handle,
                tags: response.child_options.tag.clone(),
            })
        })
    }
}
