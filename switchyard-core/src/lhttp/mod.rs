//! "Local HTTP" child processes: HTTP/1.1 spoken over a private
//! `AF_LOCAL` socket to a locally spawned process.
//!
//! Each child inherits a listening socket; the pool dials a fresh
//! per-request connection and counts it against the child's
//! concurrency limit.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::SockType;
use tokio::net::UnixStream;

use crate::address::LhttpAddress;
use crate::listen_stream::ListenStreamStock;
use crate::spawn::child_stock::{ChildProcess, ChildSocket};
use crate::spawn::{PreparedChildProcess, SpawnClient};
use crate::stock::StockError;
use crate::stock::multi::{
    MultiLease, MultiStockClass, MultiStockItem, MultiStockMap, MultiStockOptions,
};

/// Idle TTL for LHTTP children.
const CLEAR_INTERVAL: Duration = Duration::from_secs(900);

/// Lower TTL for jailed (per-account) children.
const JAILED_CLEAR_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum LhttpError {
    #[error(transparent)]
    Spawn(#[from] crate::spawn::SpawnError),

    #[error(transparent)]
    ListenStream(#[from] crate::listen_stream::ListenStreamError),

    #[error("failed to connect to LHTTP server: {0}")]
    Connect(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One LHTTP child process holding a listening socket.
pub struct LhttpChild {
    process: Arc<ChildProcess>,
    socket: ChildSocket,
}

impl LhttpChild {
    pub fn process(&self) -> &ChildProcess {
        &self.process
    }

    /// Dial a fresh connection.  If the connection fails, the child
    /// is abandoned - it will never work.
    pub async fn connect(&self) -> std::io::Result<UnixStream> {
        self.socket.connect(&self.process).await
    }
}

impl MultiStockItem for LhttpChild {
    fn fade(&self) {
        self.process.fade();
    }

    fn is_faded(&self) -> bool {
        self.process.is_faded()
    }

    fn tag(&self) -> String {
        self.process.tag().to_owned()
    }

    async fn wait_idle_broken(&self) {
        self.process.wait_exit().await;
    }

    fn destroy(&self) {
        self.process.kill();
    }
}

pub struct LhttpStockClass {
    spawn: Arc<SpawnClient>,
    listen_stream: Option<Arc<ListenStreamStock>>,
    default_limit: usize,
}

impl MultiStockClass for LhttpStockClass {
    type Item = LhttpChild;
    type Request = LhttpAddress;
    type Error = LhttpError;

    fn options(&self, address: &LhttpAddress) -> MultiStockOptions {
        MultiStockOptions {
            limit: if address.parallelism > 0 {
                address.parallelism as usize
            } else {
                self.default_limit
            },
            concurrency: address.concurrency.max(1) as usize,
            clear_interval: if address.options.ns.pivot_root.is_some() {
                JAILED_CLEAR_INTERVAL
            } else {
                CLEAR_INTERVAL
            },
        }
    }

    async fn create(
        &self,
        key: &crate::stock::StockKey,
        address: &LhttpAddress,
    ) -> Result<LhttpChild, LhttpError> {
        let mut p = PreparedChildProcess::default();
        address.copy_to(&mut p)?;

        let listen_stream_lease = match &self.listen_stream {
            Some(stock) => stock.apply(&mut p.ns)?,
            None => {
                p.ns.mount_listen_stream = None;
                None
            }
        };

        /* use twice the concurrency for the listener backlog so we
           never see ECONNREFUSED while the child initializes itself;
           cancelled requests during startup count towards the backlog
           too */
        let backlog = (address.concurrency.max(1) * 2) as i32;
        let socket_type = SockType::Stream;

        let (socket, listener_fd) = ChildSocket::create(socket_type, backlog)?;
        p.stdin = Some(listener_fd);

        let handle = self.spawn.spawn_child(&key.value, p).await?;

        Ok(LhttpChild {
            process: Arc::new(ChildProcess::new(
                &address.options.tag,
                handle,
                listen_stream_lease,
            )),
            socket,
        })
    }
}

/// A leased LHTTP connection: one fresh socket to a pooled child.
pub struct LhttpConnection {
    lease: MultiLease<LhttpStockClass>,
    stream: UnixStream,
}

impl LhttpConnection {
    pub fn stream(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    pub fn child(&self) -> &LhttpChild {
        self.lease.item()
    }

    /// Finish the request and return the concurrency slot.
    pub fn release(self) {
        self.lease.release();
    }
}

/// Launch and manage LHTTP child processes.
pub struct LhttpStock {
    map: Arc<MultiStockMap<LhttpStockClass>>,
}

impl LhttpStock {
    pub fn new(
        spawn: Arc<SpawnClient>,
        listen_stream: Option<Arc<ListenStreamStock>>,
        default_limit: usize,
    ) -> Self {
        Self {
            map: MultiStockMap::new(LhttpStockClass {
                spawn,
                listen_stream,
                default_limit,
            }),
        }
    }

    /// Lease a connection to a ready child for this address.
    pub async fn get(
        &self,
        address: &LhttpAddress,
    ) -> Result<LhttpConnection, StockError<LhttpError>> {
        let key = address.server_id();

        let lease = self.map.get(&key, address).await?;

        match lease.item().connect().await {
            Ok(stream) => Ok(LhttpConnection { lease, stream }),
            Err(e) => {
                /* connect() has already faded the child */
                lease.release();
                Err(StockError::Create(LhttpError::Connect(e)))
            }
        }
    }

    pub fn fade_all(&self) {
        self.map.fade_all();
    }

    pub fn fade_tag(&self, tag: &str) {
        self.map.fade_tag(tag);
    }

    pub fn discard_oldest_idle(&self) -> bool {
        self.map.discard_oldest_idle()
    }

    pub fn stats(&self) -> crate::stock::StockStats {
        self.map.stats()
    }
}
