//! Pools of items that may be leased several times concurrently.
//!
//! Used by the multiplexed WAS stocks: one child process carries many
//! logical streams, so a single item accepts up to `concurrency`
//! simultaneous leases.  The child only becomes idle (and thus
//! eligible for TTL expiry and LRU eviction) when all of its leases
//! have been released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{StockError, StockKey, StockStats};
use crate::string_list::string_list_contains;

/// An item shared by up to `concurrency` leases.
pub trait MultiStockItem: Send + Sync + 'static {
    /// Mark this item so it is destroyed once all leases are
    /// released, and never handed out again.
    fn fade(&self);

    fn is_faded(&self) -> bool;

    /// NUL-separated tag list for bulk fade.
    fn tag(&self) -> String {
        String::new()
    }

    /// Resolves when this fully-idle item has become unusable.
    fn wait_idle_broken(&self) -> impl std::future::Future<Output = ()> + Send {
        std::future::pending()
    }

    fn destroy(&self) {}
}

/// Pool parameters for one key of a multi stock.
#[derive(Debug, Clone, Copy)]
pub struct MultiStockOptions {
    /// Maximum number of items (child processes); 0 means unlimited.
    pub limit: usize,

    /// Maximum concurrent leases per item.
    pub concurrency: usize,

    /// Fully-idle items are destroyed when unused for this long.
    pub clear_interval: Duration,
}

/// Creates multi-stock items.
pub trait MultiStockClass: Send + Sync + Sized + 'static {
    type Item: MultiStockItem;
    type Request: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    fn options(&self, request: &Self::Request) -> MultiStockOptions;

    fn create(
        &self,
        key: &StockKey,
        request: &Self::Request,
    ) -> impl std::future::Future<Output = Result<Self::Item, Self::Error>> + Send;
}

enum Wake<I, E> {
    /// A lease on this item was reserved for the receiver.
    Item(Arc<I>),

    /// The creation the receiver was counting on failed.
    Failed(Arc<E>),

    /// Capacity may be available again; retry.
    Retry,
}

struct Entry<I> {
    serial: u64,
    item: Arc<I>,
    in_use: usize,

    /// Cancels the idle watch while the item is leased.
    idle_guard: Option<CancellationToken>,
}

struct Pool<I, E> {
    entries: Vec<Entry<I>>,

    /// Creations in flight.
    spawning: usize,

    /// Waiters already counted against in-flight creation capacity.
    claims: usize,

    waiters: VecDeque<oneshot::Sender<Wake<I, E>>>,

    options: MultiStockOptions,
}

impl<I, E> Pool<I, E> {
    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.spawning == 0 && self.waiters.is_empty()
    }

    fn below_limit(&self) -> bool {
        self.options.limit == 0 || self.entries.len() + self.spawning < self.options.limit
    }
}

struct State<I, E> {
    pools: HashMap<String, Pool<I, E>>,

    /// Fully-idle items, oldest first.
    lru: VecDeque<(String, u64)>,

    next_serial: u64,
}

impl<I: MultiStockItem, E> State<I, E> {
    fn unlink_lru(&mut self, serial: u64) {
        self.lru.retain(|&(_, s)| s != serial);
    }

    fn remove_entry(&mut self, key: &str, serial: u64) -> Option<Entry<I>> {
        let pool = self.pools.get_mut(key)?;
        let pos = pool.entries.iter().position(|e| e.serial == serial)?;
        let entry = pool.entries.remove(pos);
        self.unlink_lru(serial);
        if let Some(guard) = &entry.idle_guard {
            guard.cancel();
        }
        Some(entry)
    }

    fn maybe_remove_pool(&mut self, key: &str) {
        if let Some(pool) = self.pools.get(key)
            && pool.is_empty()
        {
            self.pools.remove(key);
        }
    }
}

/// A keyed map of multi-lease pools.
pub struct MultiStockMap<C: MultiStockClass> {
    class: C,
    state: Mutex<State<C::Item, C::Error>>,
}

impl<C: MultiStockClass> MultiStockMap<C> {
    pub fn new(class: C) -> Arc<Self> {
        Arc::new(Self {
            class,
            state: Mutex::new(State {
                pools: HashMap::new(),
                lru: VecDeque::new(),
                next_serial: 0,
            }),
        })
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    /// Lease one logical slot.  The returned lease shares its item
    /// with up to `concurrency - 1` other leases.
    pub async fn get(
        self: &Arc<Self>,
        key: &StockKey,
        request: &C::Request,
    ) -> Result<MultiLease<C>, StockError<C::Error>> {
        enum Action<I, E> {
            Leased(Arc<I>),
            Create,
            Wait(oneshot::Receiver<Wake<I, E>>),
        }

        loop {
            let action = {
                let mut state = self.state.lock();
                let options = self.class.options(request);
                let pool = state
                    .pools
                    .entry(key.value.clone())
                    .or_insert_with(|| Pool {
                        entries: Vec::new(),
                        spawning: 0,
                        claims: 0,
                        waiters: VecDeque::new(),
                        options,
                    });
                pool.options = options;

                let concurrency = options.concurrency.max(1);

                let mut leased = None;
                for entry in &mut pool.entries {
                    if entry.in_use < concurrency && !entry.item.is_faded() {
                        entry.in_use += 1;
                        if let Some(guard) = entry.idle_guard.take() {
                            guard.cancel();
                        }
                        if entry.in_use == 1 {
                            let serial = entry.serial;
                            leased = Some((entry.item.clone(), Some(serial)));
                        } else {
                            leased = Some((entry.item.clone(), None));
                        }
                        break;
                    }
                }

                match leased {
                    Some((item, unlink)) => {
                        if let Some(serial) = unlink {
                            state.unlink_lru(serial);
                        }
                        Action::Leased(item)
                    }
                    None if pool.claims < pool.spawning * concurrency => {
                        /* an in-flight creation still has uncommitted
                           capacity; wait for it */
                        pool.claims += 1;
                        let (tx, rx) = oneshot::channel();
                        pool.waiters.push_back(tx);
                        Action::Wait(rx)
                    }
                    None if pool.below_limit() => {
                        pool.spawning += 1;
                        pool.claims += 1;
                        Action::Create
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        pool.waiters.push_back(tx);
                        Action::Wait(rx)
                    }
                }
            };

            match action {
                Action::Leased(item) => {
                    return Ok(MultiLease::new(Arc::clone(self), key.clone(), item));
                }

                Action::Create => {
                    let result = self.class.create(key, request).await;
                    return self.finish_create(key, result);
                }

                Action::Wait(rx) => match rx.await {
                    Ok(Wake::Item(item)) => {
                        return Ok(MultiLease::new(Arc::clone(self), key.clone(), item));
                    }
                    Ok(Wake::Failed(e)) => return Err(StockError::Shared(e)),
                    Ok(Wake::Retry) | Err(_) => continue,
                },
            }
        }
    }

    fn finish_create(
        self: &Arc<Self>,
        key: &StockKey,
        result: Result<C::Item, C::Error>,
    ) -> Result<MultiLease<C>, StockError<C::Error>> {
        let mut state = self.state.lock();

        match result {
            Ok(item) => {
                let serial = state.next_serial;
                state.next_serial += 1;

                let item = Arc::new(item);
                let pool = state.pools.get_mut(&key.value).expect("pool exists");
                pool.spawning -= 1;
                pool.claims = pool.claims.saturating_sub(1);

                let concurrency = pool.options.concurrency.max(1);
                let mut entry = Entry {
                    serial,
                    item: Arc::clone(&item),
                    in_use: 1,
                    idle_guard: None,
                };

                /* hand the remaining capacity to waiters, FIFO */
                while entry.in_use < concurrency {
                    let Some(waiter) = pool.waiters.pop_front() else {
                        break;
                    };

                    if waiter.send(Wake::Item(Arc::clone(&item))).is_ok() {
                        entry.in_use += 1;
                        pool.claims = pool.claims.saturating_sub(1);
                    }
                }

                pool.entries.push(entry);
                debug!(key = %key.value, "created multi stock item");

                Ok(MultiLease::new(Arc::clone(self), key.clone(), item))
            }

            Err(e) => {
                let shared = Arc::new(e);

                let pool = state.pools.get_mut(&key.value).expect("pool exists");
                pool.spawning -= 1;
                pool.claims = pool.claims.saturating_sub(1);

                /* waiters that were counting on this creation inherit
                   the failure */
                let mut victims = pool.claims;
                pool.claims = 0;
                while victims > 0 {
                    let Some(waiter) = pool.waiters.pop_front() else {
                        break;
                    };
                    if waiter.send(Wake::Failed(Arc::clone(&shared))).is_ok() {
                        victims -= 1;
                    }
                }

                state.maybe_remove_pool(&key.value);
                Err(StockError::Shared(shared))
            }
        }
    }

    fn release(self: &Arc<Self>, key: &StockKey, item: &Arc<C::Item>) {
        let mut state = self.state.lock();
        let Some(pool) = state.pools.get_mut(&key.value) else {
            return;
        };

        let Some(pos) = pool
            .entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.item, item))
        else {
            /* creation raced with a fade that removed the entry */
            item.destroy();
            return;
        };

        let entry = &mut pool.entries[pos];
        entry.in_use -= 1;

        if entry.item.is_faded() {
            if entry.in_use == 0 {
                let serial = entry.serial;
                let entry = state
                    .remove_entry(&key.value, serial)
                    .expect("entry exists");
                entry.item.destroy();
                state.maybe_remove_pool(&key.value);
            }
            return;
        }

        /* freed capacity: hand it to the next live waiter */
        while let Some(waiter) = pool.waiters.pop_front() {
            if waiter
                .send(Wake::Item(Arc::clone(&pool.entries[pos].item)))
                .is_ok()
            {
                pool.entries[pos].in_use += 1;
                return;
            }
        }

        let entry = &mut pool.entries[pos];
        if entry.in_use == 0 {
            /* fully idle now: put on the LRU and start the idle
               watch */
            let serial = entry.serial;
            let guard = CancellationToken::new();
            entry.idle_guard = Some(guard.clone());
            let watched = Arc::clone(&entry.item);
            let clear_interval = pool.options.clear_interval;
            state.lru.push_back((key.value.clone(), serial));
            drop(state);

            self.spawn_idle_watch(key.value.clone(), serial, watched, guard, clear_interval);
        }
    }

    fn spawn_idle_watch(
        self: &Arc<Self>,
        key: String,
        serial: u64,
        item: Arc<C::Item>,
        guard: CancellationToken,
        clear_interval: Duration,
    ) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let stock = Arc::clone(self);
        handle.spawn(async move {
            let broken = tokio::select! {
                () = guard.cancelled() => return,
                () = tokio::time::sleep(clear_interval) => false,
                () = item.wait_idle_broken() => true,
            };

            let mut state = stock.state.lock();
            if let Some(entry) = state.remove_entry(&key, serial) {
                if broken {
                    debug!(key, "idle multi stock item became unusable");
                } else {
                    debug!(key, "idle multi stock item expired");
                }
                entry.item.destroy();
            }
            state.maybe_remove_pool(&key);
        });
    }

    /// Evict the least-recently-used fully-idle item.
    pub fn discard_oldest_idle(&self) -> bool {
        let mut state = self.state.lock();

        loop {
            let Some((key, serial)) = state.lru.front().cloned() else {
                return false;
            };

            if let Some(entry) = state.remove_entry(&key, serial) {
                debug!(key, "discarding oldest idle multi stock item");
                entry.item.destroy();
                state.maybe_remove_pool(&key);
                return true;
            }

            state.lru.pop_front();
        }
    }

    pub fn fade_all(&self) {
        self.fade_if(|_| true);
    }

    pub fn fade_tag(&self, tag: &str) {
        self.fade_if(|item_tag| string_list_contains(item_tag, tag));
    }

    fn fade_if(&self, predicate: impl Fn(&str) -> bool) {
        let mut state = self.state.lock();

        let keys: Vec<String> = state.pools.keys().cloned().collect();
        for key in keys {
            loop {
                let Some((serial, idle)) = state.pools.get(&key).and_then(|pool| {
                    pool.entries
                        .iter()
                        .find(|e| !e.item.is_faded() && predicate(&e.item.tag()))
                        .map(|e| (e.serial, e.in_use == 0))
                }) else {
                    break;
                };

                if idle {
                    if let Some(entry) = state.remove_entry(&key, serial) {
                        entry.item.fade();
                        entry.item.destroy();
                    }
                } else {
                    let pool = state.pools.get_mut(&key).expect("pool exists");
                    if let Some(entry) = pool.entries.iter().find(|e| e.serial == serial) {
                        entry.item.fade();
                    }
                }
            }

            state.maybe_remove_pool(&key);
        }
    }

    pub fn stats(&self) -> StockStats {
        let state = self.state.lock();
        let mut stats = StockStats::default();
        for pool in state.pools.values() {
            for entry in &pool.entries {
                if entry.in_use > 0 {
                    stats.busy += 1;
                } else {
                    stats.idle += 1;
                }
            }
            stats.busy += pool.spawning;
        }
        stats
    }
}

/// One logical lease on a shared multi-stock item.
pub struct MultiLease<C: MultiStockClass> {
    stock: Arc<MultiStockMap<C>>,
    key: StockKey,
    item: Option<Arc<C::Item>>,
}

impl<C: MultiStockClass> MultiLease<C> {
    fn new(stock: Arc<MultiStockMap<C>>, key: StockKey, item: Arc<C::Item>) -> Self {
        Self {
            stock,
            key,
            item: Some(item),
        }
    }

    pub fn item(&self) -> &C::Item {
        self.item.as_deref().expect("lease already released")
    }

    pub fn key(&self) -> &StockKey {
        &self.key
    }

    /// Release this logical slot.  The shared item is unaffected;
    /// call `item().fade()` first to condemn the whole child.
    pub fn release(mut self) {
        if let Some(item) = self.item.take() {
            self.stock.release(&self.key, &item);
        }
    }
}

impl<C: MultiStockClass> Drop for MultiLease<C> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.stock.release(&self.key, &item);
        }
    }
}
