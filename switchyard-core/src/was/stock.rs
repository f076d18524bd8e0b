//! The plain WAS stock: one child process per connection, reached
//! over its private control socket and body pipes.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::idle::WasIdleConnection;
use super::launch::{WasLaunchError, was_launch};
use super::params::CgiChildParams;
use crate::address::CgiAddress;
use crate::listen_stream::ListenStreamStock;
use crate::spawn::SpawnClient;
use crate::spawn::child_stock::ChildProcess;
use crate::stock::{
    StockClass, StockError, StockItem, StockLease, StockMap, StockOptions, StockStats,
};

/// Idle TTL for plain WAS children.
const CLEAR_INTERVAL: Duration = Duration::from_secs(600);

/// Lower TTL for jailed (per-account) children.
const JAILED_CLEAR_INTERVAL: Duration = Duration::from_secs(300);

/// One WAS child process with its connection.
pub struct WasChild {
    process: ChildProcess,
    connection: WasIdleConnection,
    disposable: bool,
}

impl WasChild {
    pub fn connection(&self) -> &WasIdleConnection {
        &self.connection
    }

    pub fn process(&self) -> &ChildProcess {
        &self.process
    }
}

impl StockItem for WasChild {
    fn borrow(&self) -> bool {
        /* a child still recovering from STOP must not carry a new
           request */
        self.connection.may_borrow() && !self.process.has_exited()
    }

    fn release(&self) -> bool {
        !self.disposable && !self.process.has_exited()
    }

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
            e = self.connection.wait_broken() => {
                debug!("idle WAS connection failed: {e}");
            }
            _ = self.process.wait_exit() => {}
        }
    }

    fn destroy(&self) {
        self.process.kill();
    }
}

pub struct WasStockClass {
    spawn: Arc<SpawnClient>,
    listen_stream: Option<Arc<ListenStreamStock>>,
    default_limit: usize,
}

impl StockClass for WasStockClass {
    type Item = WasChild;
    type Request = CgiChildParams;
    type Error = WasLaunchError;

    fn options(&self, request: &CgiChildParams) -> StockOptions {
        StockOptions {
            limit: if request.parallelism > 0 {
                request.parallelism as usize
            } else {
                self.default_limit
            },
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
    ) -> Result<WasChild, WasLaunchError> {
        let launch = was_launch(
            &self.spawn,
            self.listen_stream.as_ref(),
            &key.value,
            &request.executable_path,
            &request.args,
            &request.options,
        )
        .await?;

        Ok(WasChild {
            process: ChildProcess::new(
                &request.options.tag,
                launch.handle,
                launch.listen_stream_lease,
            ),
            connection: WasIdleConnection::new(launch.socket)?,
            disposable: request.disposable,
        })
    }
}

/// A leased WAS connection.
pub type WasLease = StockLease<WasStockClass>;

/// Launch and manage plain WAS child processes.
pub struct WasStock {
    map: Arc<StockMap<WasStockClass>>,
}

impl WasStock {
    pub fn new(
        spawn: Arc<SpawnClient>,
        listen_stream: Option<Arc<ListenStreamStock>>,
        default_limit: usize,
    ) -> Self {
        Self {
            map: StockMap::new(WasStockClass {
                spawn,
                listen_stream,
                default_limit,
            }),
        }
    }

    /// Lease a ready child for this address.
    pub async fn get(
        &self,
        address: &CgiAddress,
    ) -> Result<WasLease, StockError<WasLaunchError>> {
        let params = CgiChildParams::new(address);
        let key = params.stock_key();
        self.map.get(&key, &params).await
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

    pub fn stats(&self) -> StockStats {
        self.map.stats()
    }
}
