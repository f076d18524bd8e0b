//! Bounded pools of reusable resources keyed by fingerprint.
//!
//! A `StockMap` is a table of per-key pools.  Leases are exclusive;
//! releasing an item either returns it to its pool's idle list or
//! destroys it.  Idle items are watched (TTL plus a per-item broken
//! detector) and participate in a cross-pool LRU so that memory
//! pressure can evict the least-recently-used idle item.

pub mod multi;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hash::StringWithHash;
use crate::string_list::string_list_contains;

/// The fingerprint a pool is keyed by.
pub type StockKey = StringWithHash;

#[derive(Debug, Error)]
pub enum StockError<E> {
    /// Creating a new item failed.
    #[error(transparent)]
    Create(E),

    /// A creation this caller was waiting on failed; the error is
    /// shared with the original creator.
    #[error("{0}")]
    Shared(Arc<E>),

    /// The parallelism limit is reached, no idle item exists, and the
    /// caller asked not to wait.
    #[error("stock limit exceeded")]
    LimitExceeded,
}

/// Aggregated counters for the control-plane `STATS` response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockStats {
    pub busy: usize,
    pub idle: usize,
}

/// Per-key pool parameters, resolved by the stock class from the
/// request.
#[derive(Debug, Clone, Copy)]
pub struct StockOptions {
    /// Maximum number of items for this key; 0 means unlimited.
    pub limit: usize,

    /// Idle items are destroyed when unused for this long.
    pub clear_interval: Duration,
}

impl Default for StockOptions {
    fn default() -> Self {
        Self {
            limit: 0,
            clear_interval: Duration::from_secs(600),
        }
    }
}

/// An item managed by a stock.
pub trait StockItem: Send + Sync + 'static {
    /// Called when the item is leased from the idle list.  Returning
    /// `false` destroys the item and the stock falls back to another
    /// idle item or a fresh creation.
    fn borrow(&self) -> bool {
        true
    }

    /// Called when a lease is returned with `reuse=true`.  Returning
    /// `false` destroys the item instead of idling it.
    fn release(&self) -> bool {
        true
    }

    /// Mark this item so it is destroyed instead of reused.
    fn fade(&self);

    fn is_faded(&self) -> bool;

    /// NUL-separated tag list for bulk fade.
    fn tag(&self) -> String {
        String::new()
    }

    /// Resolves when this idle item has become unusable (peer hung
    /// up, unexpected data, child exited).  Polled only while the
    /// item is idle.
    fn wait_idle_broken(&self) -> impl std::future::Future<Output = ()> + Send {
        std::future::pending()
    }

    /// Final cleanup before the stock drops its reference.
    fn destroy(&self) {}
}

/// Creates stock items.
pub trait StockClass: Send + Sync + Sized + 'static {
    type Item: StockItem;
    type Request: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Pool parameters for this request.
    fn options(&self, request: &Self::Request) -> StockOptions;

    /// Create one new item.  This is the suspension point where the
    /// spawner admission queue applies.
    fn create(
        &self,
        key: &StockKey,
        request: &Self::Request,
    ) -> impl std::future::Future<Output = Result<Self::Item, Self::Error>> + Send;
}

enum Wake<I> {
    /// An already-borrowed item handed over directly by the releaser.
    Item(Arc<I>),

    /// A creation slot was reserved for the receiver; create now.
    ReservedSlot,
}

struct IdleEntry<I> {
    serial: u64,
    item: Arc<I>,
    guard: CancellationToken,
}

struct Pool<I> {
    /// Idle items; the front is the oldest.
    idle: VecDeque<IdleEntry<I>>,

    /// Number of leased items plus creations in flight.
    busy: usize,

    /// Weak handles to leased items, so bulk fade can flag them.
    busy_items: Vec<Weak<I>>,

    /// FIFO of waiting borrowers.
    waiters: VecDeque<oneshot::Sender<Wake<I>>>,

    options: StockOptions,
}

impl<I> Pool<I> {
    fn new(options: StockOptions) -> Self {
        Self {
            idle: VecDeque::new(),
            busy: 0,
            busy_items: Vec::new(),
            waiters: VecDeque::new(),
            options,
        }
    }

    fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.busy == 0 && self.waiters.is_empty()
    }

    fn below_limit(&self) -> bool {
        self.options.limit == 0 || self.busy + self.idle.len() < self.options.limit
    }

    fn note_busy(&mut self, item: &Arc<I>) {
        self.busy_items.retain(|w| w.strong_count() > 0);
        self.busy_items.push(Arc::downgrade(item));
    }
}

struct State<I> {
    pools: HashMap<String, Pool<I>>,

    /// Cross-pool idle order: the front is the eviction victim.
    /// This list and the pools' idle lists are only ever updated
    /// together, under the one lock guarding this struct.
    lru: VecDeque<(String, u64)>,

    next_serial: u64,
}

impl<I: StockItem> State<I> {
    fn unlink_lru(&mut self, serial: u64) {
        self.lru.retain(|&(_, s)| s != serial);
    }

    /// Remove one idle entry, keeping the LRU in sync.  Returns the
    /// entry if it was still present.
    fn take_idle(&mut self, key: &str, serial: u64) -> Option<IdleEntry<I>> {
        let pool = self.pools.get_mut(key)?;
        let pos = pool.idle.iter().position(|e| e.serial == serial)?;
        let entry = pool.idle.remove(pos).expect("position was just found");
        self.unlink_lru(serial);
        entry.guard.cancel();
        Some(entry)
    }

    fn maybe_remove_pool(&mut self, key: &str) {
        if let Some(pool) = self.pools.get(key)
            && pool.is_empty()
        {
            self.pools.remove(key);
        }
    }

    /// Hand a freed creation slot to the next live waiter.  The
    /// reservation (busy count) is transferred to the waiter.
    fn wake_slot(&mut self, key: &str) {
        if let Some(pool) = self.pools.get_mut(key) {
            while let Some(waiter) = pool.waiters.pop_front() {
                if waiter.send(Wake::ReservedSlot).is_ok() {
                    pool.busy += 1;
                    return;
                }
            }
        }
    }
}

/// A keyed map of bounded pools.
pub struct StockMap<C: StockClass> {
    class: C,
    state: Mutex<State<C::Item>>,
}

/// Undoes a creation reservation if the creating future is dropped or
/// the creation fails.
struct CreateReservation<'a, C: StockClass> {
    stock: &'a Arc<StockMap<C>>,
    key: &'a StockKey,
    armed: bool,
}

impl<C: StockClass> CreateReservation<'_, C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: StockClass> Drop for CreateReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.stock.state.lock();
            if let Some(pool) = state.pools.get_mut(&self.key.value) {
                pool.busy -= 1;
            }
            state.wake_slot(&self.key.value);
            state.maybe_remove_pool(&self.key.value);
        }
    }
}

impl<C: StockClass> StockMap<C> {
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

    /// Lease a ready item.  If an idle item exists, the lease
    /// completes without suspending; otherwise a new item is created,
    /// or the caller waits FIFO for a slot when the pool is at its
    /// parallelism limit.
    ///
    /// Dropping the returned future while waiting promptly gives up
    /// the queue slot without waking any other waiter.
    pub async fn get(
        self: &Arc<Self>,
        key: &StockKey,
        request: &C::Request,
    ) -> Result<StockLease<C>, StockError<C::Error>> {
        self.do_get(key, request, true).await
    }

    /// Like `get()`, but fails with `LimitExceeded` instead of
    /// waiting.
    pub async fn get_no_wait(
        self: &Arc<Self>,
        key: &StockKey,
        request: &C::Request,
    ) -> Result<StockLease<C>, StockError<C::Error>> {
        self.do_get(key, request, false).await
    }

    async fn do_get(
        self: &Arc<Self>,
        key: &StockKey,
        request: &C::Request,
        may_wait: bool,
    ) -> Result<StockLease<C>, StockError<C::Error>> {
        enum Action<I> {
            Leased(Arc<I>),
            Create,
            Wait(oneshot::Receiver<Wake<I>>),
        }

        loop {
            let action = {
                let mut state = self.state.lock();
                let options = self.class.options(request);
                state
                    .pools
                    .entry(key.value.clone())
                    .or_insert_with(|| Pool::new(options))
                    .options = options;

                /* prefer an idle item */
                let mut leased = None;
                loop {
                    let Some(entry) = state
                        .pools
                        .get_mut(&key.value)
                        .and_then(|pool| pool.idle.pop_front())
                    else {
                        break;
                    };

                    state.unlink_lru(entry.serial);
                    entry.guard.cancel();

                    if entry.item.is_faded() || !entry.item.borrow() {
                        debug!(key = %key.value, "discarding unusable idle item");
                        entry.item.destroy();
                        continue;
                    }

                    leased = Some(entry.item);
                    break;
                }

                let pool = state.pools.get_mut(&key.value).expect("pool exists");
                match leased {
                    Some(item) => {
                        pool.busy += 1;
                        pool.note_busy(&item);
                        Action::Leased(item)
                    }
                    None if pool.below_limit() => {
                        pool.busy += 1;
                        Action::Create
                    }
                    None if may_wait => {
                        let (tx, rx) = oneshot::channel();
                        pool.waiters.push_back(tx);
                        Action::Wait(rx)
                    }
                    None => return Err(StockError::LimitExceeded),
                }
            };

            match action {
                Action::Leased(item) => {
                    return Ok(StockLease::new(Arc::clone(self), key.clone(), item));
                }

                Action::Create => {
                    let reservation = CreateReservation {
                        stock: self,
                        key,
                        armed: true,
                    };

                    match self.class.create(key, request).await {
                        Ok(item) => {
                            reservation.disarm();
                            debug!(key = %key.value, "created stock item");
                            let item = Arc::new(item);
                            self.state
                                .lock()
                                .pools
                                .get_mut(&key.value)
                                .expect("pool exists")
                                .note_busy(&item);
                            return Ok(StockLease::new(Arc::clone(self), key.clone(), item));
                        }
                        Err(e) => {
                            /* the reservation guard releases the slot
                               and wakes the next waiter, which will
                               retry with a fresh creation */
                            drop(reservation);
                            return Err(StockError::Create(e));
                        }
                    }
                }

                Action::Wait(rx) => match rx.await {
                    Ok(Wake::Item(item)) => {
                        self.state
                            .lock()
                            .pools
                            .get_mut(&key.value)
                            .expect("pool exists")
                            .note_busy(&item);
                        return Ok(StockLease::new(Arc::clone(self), key.clone(), item));
                    }
                    Ok(Wake::ReservedSlot) => {
                        /* a slot was reserved for us; create */
                        let reservation = CreateReservation {
                            stock: self,
                            key,
                            armed: true,
                        };

                        match self.class.create(key, request).await {
                            Ok(item) => {
                                reservation.disarm();
                                let item = Arc::new(item);
                                self.state
                                    .lock()
                                    .pools
                                    .get_mut(&key.value)
                                    .expect("pool exists")
                                    .note_busy(&item);
                                return Ok(StockLease::new(Arc::clone(self), key.clone(), item));
                            }
                            Err(e) => {
                                drop(reservation);
                                return Err(StockError::Create(e));
                            }
                        }
                    }
                    Err(_) => {
                        /* stock shut down under us; start over */
                        continue;
                    }
                },
            }
        }
    }

    /// Return a lease.  With `reuse=false` the item is destroyed
    /// immediately.
    fn release(self: &Arc<Self>, key: &StockKey, item: Arc<C::Item>, reuse: bool) {
        let reuse = reuse && !item.is_faded() && item.release();

        let mut state = self.state.lock();
        if !state.pools.contains_key(&key.value) {
            item.destroy();
            return;
        }

        if !reuse {
            let pool = state.pools.get_mut(&key.value).expect("pool exists");
            pool.busy -= 1;
            item.destroy();
            state.wake_slot(&key.value);
            state.maybe_remove_pool(&key.value);
            return;
        }

        /* direct handoff to the first live waiter keeps completions
           FIFO */
        loop {
            let pool = state.pools.get_mut(&key.value).expect("pool exists");
            let Some(waiter) = pool.waiters.pop_front() else {
                break;
            };

            if !item.borrow() {
                /* became unusable between release and handoff; give
                   the waiter the freed slot instead */
                pool.waiters.push_front(waiter);
                pool.busy -= 1;
                item.destroy();
                state.wake_slot(&key.value);
                return;
            }

            if waiter.send(Wake::Item(Arc::clone(&item))).is_ok() {
                /* busy count unchanged: the lease moved to the
                   waiter */
                return;
            }

            /* waiter was cancelled; un-borrow and try the next one */
            if !item.release() {
                let pool = state.pools.get_mut(&key.value).expect("pool exists");
                pool.busy -= 1;
                item.destroy();
                state.wake_slot(&key.value);
                state.maybe_remove_pool(&key.value);
                return;
            }
        }

        /* no waiter; move to the idle list */
        let serial = state.next_serial;
        state.next_serial += 1;

        let guard = CancellationToken::new();
        let pool = state.pools.get_mut(&key.value).expect("pool exists");
        pool.busy -= 1;
        let clear_interval = pool.options.clear_interval;
        pool.idle.push_back(IdleEntry {
            serial,
            item: Arc::clone(&item),
            guard: guard.clone(),
        });
        state.lru.push_back((key.value.clone(), serial));
        drop(state);

        self.spawn_idle_watch(key.value.clone(), serial, item, guard, clear_interval);
    }

    /// Watch one idle item: destroy it when its TTL elapses or it
    /// reports itself broken.
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
            if let Some(entry) = state.take_idle(&key, serial) {
                if broken {
                    debug!(key, "idle stock item became unusable");
                } else {
                    debug!(key, "idle stock item expired");
                }
                entry.item.destroy();
            }
            state.maybe_remove_pool(&key);
        });
    }

    /// Evict the least-recently-used idle item across all pools.
    /// Returns whether an eviction occurred; repeated calls evict
    /// distinct items until no idle item remains.
    pub fn discard_oldest_idle(&self) -> bool {
        let mut state = self.state.lock();

        loop {
            let Some((key, serial)) = state.lru.front().cloned() else {
                return false;
            };

            if let Some(entry) = state.take_idle(&key, serial) {
                debug!(key, "discarding oldest idle stock item");
                entry.item.destroy();
                state.maybe_remove_pool(&key);
                return true;
            }

            /* stale entry; drop it and go on */
            state.lru.pop_front();
        }
    }

    pub fn has_idle(&self) -> bool {
        !self.state.lock().lru.is_empty()
    }

    /// Mark all items so they are destroyed on release; destroy all
    /// idle items right away.
    pub fn fade_all(&self) {
        self.fade_if(|_| true);
    }

    /// Fade items whose tag list contains `tag`.
    pub fn fade_tag(&self, tag: &str) {
        self.fade_if(|item_tag| string_list_contains(item_tag, tag));
    }

    fn fade_if(&self, predicate: impl Fn(&str) -> bool) {
        let mut state = self.state.lock();

        let keys: Vec<String> = state.pools.keys().cloned().collect();
        for key in keys {
            /* flag matching leased items; the flag makes the next
               release destroy them */
            let busy: Vec<Weak<C::Item>> = state
                .pools
                .get(&key)
                .map(|pool| pool.busy_items.clone())
                .unwrap_or_default();
            for weak in busy {
                if let Some(item) = weak.upgrade()
                    && predicate(&item.tag())
                {
                    item.fade();
                }
            }

            /* destroy matching idle items right away so the next get
               spawns a fresh process */
            loop {
                let Some(serial) = state.pools.get(&key).and_then(|pool| {
                    pool.idle
                        .iter()
                        .find(|e| predicate(&e.item.tag()))
                        .map(|e| e.serial)
                }) else {
                    break;
                };

                if let Some(entry) = state.take_idle(&key, serial) {
                    entry.item.fade();
                    entry.item.destroy();
                }
            }

            state.maybe_remove_pool(&key);
        }
    }

    pub fn stats(&self) -> StockStats {
        let state = self.state.lock();
        let mut stats = StockStats::default();
        for pool in state.pools.values() {
            stats.busy += pool.busy;
            stats.idle += pool.idle.len();
        }
        stats
    }
}

/// An exclusive borrow of one stock item.  Dropping the lease without
/// an explicit `release()` destroys the item.
pub struct StockLease<C: StockClass> {
    stock: Arc<StockMap<C>>,
    key: StockKey,
    item: Option<Arc<C::Item>>,
}

impl<C: StockClass> StockLease<C> {
    fn new(stock: Arc<StockMap<C>>, key: StockKey, item: Arc<C::Item>) -> Self {
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

    /// Return the lease; `reuse=false` destroys the item.
    pub fn release(mut self, reuse: bool) {
        if let Some(item) = self.item.take() {
            self.stock.release(&self.key, item, reuse);
        }
    }
}

impl<C: StockClass> Drop for StockLease<C> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.stock.release(&self.key, item, false);
        }
    }
}
