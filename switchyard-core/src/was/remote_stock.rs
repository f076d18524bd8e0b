//! The remote Multi-WAS stock: instead of spawning, dial a
//! pre-existing `AF_LOCAL` `SOCK_SEQPACKET` address.
//!
//! "Remote" notwithstanding, the multiplexed protocol passes file
//! descriptors and is therefore only specified over UNIX sockets;
//! `CgiAddress::check()` rejects anything else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, socket};
use tracing::debug;

use super::idle::WasIdleConnection;
use super::multi_client::MultiClient;
use crate::hash::StringWithHash;
use crate::stock::StockError;
use crate::stock::multi::{
    MultiLease, MultiStockClass, MultiStockItem, MultiStockMap, MultiStockOptions,
};

/// Idle TTL for remote multiplexer connections.
const CLEAR_INTERVAL: Duration = Duration::from_secs(300);

/// Request parameters: the socket path plus the limits from the
/// resource address.
#[derive(Debug, Clone)]
pub struct RemoteWasParams {
    /// `AF_LOCAL` socket path (or `@name` in the abstract namespace).
    pub address: String,

    pub parallelism: u32,
    pub concurrency: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteWasError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One multiplexer connection to a remote WAS server.
pub struct RemoteWasConnection {
    client: MultiClient,
    faded: AtomicBool,
}

impl RemoteWasConnection {
    pub async fn connect_stream(&self) -> std::io::Result<WasIdleConnection> {
        let socket = self.client.connect().await?;
        WasIdleConnection::new(socket)
    }
}

impl MultiStockItem for RemoteWasConnection {
    fn fade(&self) {
        self.faded.store(true, Ordering::Relaxed);
    }

    fn is_faded(&self) -> bool {
        self.faded.load(Ordering::Relaxed)
    }

    async fn wait_idle_broken(&self) {
        self.client.wait_disconnect().await;
        debug!("remote WAS peer disconnected");
    }
}

pub struct RemoteWasStockClass {
    default_limit: usize,
}

impl MultiStockClass for RemoteWasStockClass {
    type Item = RemoteWasConnection;
    type Request = RemoteWasParams;
    type Error = RemoteWasError;

    fn options(&self, request: &RemoteWasParams) -> MultiStockOptions {
        MultiStockOptions {
            limit: if request.parallelism > 0 {
                request.parallelism as usize
            } else {
                self.default_limit
            },
            concurrency: request.concurrency.max(1) as usize,
            clear_interval: CLEAR_INTERVAL,
        }
    }

    async fn create(
        &self,
        _key: &crate::stock::StockKey,
        request: &RemoteWasParams,
    ) -> Result<RemoteWasConnection, RemoteWasError> {
        let socket = connect_seqpacket(&request.address).map_err(|e| RemoteWasError::Connect {
            address: request.address.clone(),
            source: e,
        })?;

        Ok(RemoteWasConnection {
            client: MultiClient::new(socket)?,
            faded: AtomicBool::new(false),
        })
    }
}

fn connect_seqpacket(address: &str) -> std::io::Result<std::os::fd::OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(std::io::Error::from)?;

    let addr = if let Some(name) = address.strip_prefix('@') {
        UnixAddr::new_abstract(name.as_bytes()).map_err(std::io::Error::from)?
    } else {
        UnixAddr::new(address).map_err(std::io::Error::from)?
    };

    match nix::sys::socket::connect(std::os::fd::AsRawFd::as_raw_fd(&fd), &addr) {
        Ok(()) => Ok(fd),
        /* non-blocking connect on AF_LOCAL completes immediately or
           yields EAGAIN when the backlog is full */
        Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINPROGRESS) => Ok(fd),
        Err(e) => Err(e.into()),
    }
}

/// One leased logical stream on a remote WAS multiplexer.
pub struct RemoteWasStream {
    lease: MultiLease<RemoteWasStockClass>,
    connection: WasIdleConnection,
}

impl RemoteWasStream {
    pub fn connection(&self) -> &WasIdleConnection {
        &self.connection
    }

    pub fn release(self) {
        self.lease.release();
    }
}

/// Connections to pre-existing Multi-WAS servers; no spawning.  The
/// same parallelism and concurrency accounting as the spawning stock
/// applies.
pub struct RemoteWasStock {
    map: Arc<MultiStockMap<RemoteWasStockClass>>,
}

impl RemoteWasStock {
    pub fn new(default_limit: usize) -> Self {
        Self {
            map: MultiStockMap::new(RemoteWasStockClass { default_limit }),
        }
    }

    pub async fn get(
        &self,
        params: &RemoteWasParams,
    ) -> Result<RemoteWasStream, StockError<RemoteWasError>> {
        let key = StringWithHash::new(params.address.clone());

        let lease = self.map.get(&key, params).await?;

        match lease.item().connect_stream().await {
            Ok(connection) => Ok(RemoteWasStream { lease, connection }),
            Err(e) => {
                lease.item().fade();
                lease.release();
                Err(StockError::Create(RemoteWasError::Io(e)))
            }
        }
    }

    pub fn fade_all(&self) {
        self.map.fade_all();
    }

    pub fn discard_oldest_idle(&self) -> bool {
        self.map.discard_oldest_idle()
    }

    pub fn stats(&self) -> crate::stock::StockStats {
        self.map.stats()
    }
}
