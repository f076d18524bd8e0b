//! The multiplexed WAS stock: one spawned child carries many logical
//! request streams over a single `SOCK_SEQPACKET` socket.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use tracing::debug;

use super::idle::WasIdleConnection;
use super::launch::WasLaunchError;
use super::multi_client::MultiClient;
use super::params::CgiChildParams;
use crate::address::CgiAddress;
use crate::listen_stream::ListenStreamStock;
use crate::spawn::child_stock::ChildProcess;
use crate::spawn::{PreparedChildProcess, SpawnClient};
use crate::stock::StockError;
use crate::stock::multi::{
    MultiLease, MultiStockClass, MultiStockItem, MultiStockMap, MultiStockOptions,
};

/// Idle TTL for multiplexed WAS children.
const CLEAR_INTERVAL: Duration = Duration::from_secs(900);

/// Lower TTL for jailed (per-account) children.
const JAILED_CLEAR_INTERVAL: Duration = Duration::from_secs(300);

/// One multiplexed WAS child process.
pub struct MultiWasChild {
    process: ChildProcess,
    client: MultiClient,
}

impl MultiWasChild {
    pub fn process(&self) -> &ChildProcess {
        &self.process
    }

    /// Open a new logical stream to this child.
    pub async fn connect(&self) -> std::io::Result<WasIdleConnection> {
        let socket = self.client.connect().await?;
        WasIdleConnection::new(socket)
    }
}

impl MultiStockItem for MultiWasChild {
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
        tokio::select! {
            () = self.client.wait_disconnect() => {
                debug!("multi-WAS peer disconnected");
            }
            _ = self.process.wait_exit() => {}
        }
    }

    fn destroy(&self) {
        self.process.kill();
    }
}

pub struct MultiWasStockClass {
    spawn: Arc<SpawnClient>,
    listen_stream: Option<Arc<ListenStreamStock>>,
    default_limit: usize,
}

impl MultiStockClass for MultiWasStockClass {
    type Item = MultiWasChild;
    type Request = CgiChildParams;
    type Error = WasLaunchError;

    fn options(&self, request: &CgiChildParams) -> MultiStockOptions {
        MultiStockOptions {
            limit: if request.parallelism > 0 {
                request.parallelism as usize
            } else {
                self.default_limit
            },
            concurrency: request.concurrency.max(1) as usize,
            clear_interval: if request.is_jailed() {
                JAILED_CLEAR_INTERVAL
            } else {
                CLEAR_INTERVAL
            },
        }
    }

    async fn create(
        &self,
        key: &crate::stock::StockKey,
        request: &CgiChildParams,
    ) -> Result<MultiWasChild, WasLaunchError> {
        let mut p = PreparedChildProcess::default();
        p.append(&request.executable_path);
        for i in &request.args {
            p.append(i);
        }

        request.options.copy_to(&mut p)?;

        let listen_stream_lease = match &self.listen_stream {
            Some(stock) => stock.apply(&mut p.ns)?,
            None => {
                p.ns.mount_listen_stream = None;
                None
            }
        };

        /* the multiplexer socket becomes the child's stdin */
        let (for_parent, for_child) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )
        .map_err(std::io::Error::from)?;
        p.stdin = Some(for_child);

        let handle = self.spawn.spawn_child(&key.value, p).await?;

        Ok(MultiWasChild {
            process: ChildProcess::new(&request.options.tag, handle, listen_stream_lease),
            client: MultiClient::new(for_parent)?,
        })
    }
}

/// One leased logical stream on a multiplexed WAS child.
pub struct MultiWasConnection {
    lease: MultiLease<MultiWasStockClass>,
    connection: WasIdleConnection,
}

impl MultiWasConnection {
    pub fn connection(&self) -> &WasIdleConnection {
        &self.connection
    }

    pub fn child(&self) -> &MultiWasChild {
        self.lease.item()
    }

    /// Finish this stream and return the slot to the child.
    pub fn release(self) {
        self.lease.release();
    }
}

/// Launch and manage multiplexed WAS child processes.
pub struct MultiWasStock {
    map: Arc<MultiStockMap<MultiWasStockClass>>,
}

impl MultiWasStock {
    pub fn new(
        spawn: Arc<SpawnClient>,
        listen_stream: Option<Arc<ListenStreamStock>>,
        default_limit: usize,
    ) -> Self {
        Self {
            map: MultiStockMap::new(MultiWasStockClass {
                spawn,
                listen_stream,
                default_limit,
            }),
        }
    }

    /// Lease one logical stream, spawning a child on demand.
    pub async fn get(
        &self,
        address: &CgiAddress,
    ) -> Result<MultiWasConnection, StockError<WasLaunchError>> {
        let params = CgiChildParams::new(address);
        let key = params.stock_key();

        let lease = self.map.get(&key, &params).await?;

        match lease.item().connect().await {
            Ok(connection) => Ok(MultiWasConnection { lease, connection }),
            Err(e) => {
                /* the multiplexer is broken; condemn the child */
                lease.item().fade();
                lease.release();
                Err(StockError::Create(WasLaunchError::Io(e)))
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
