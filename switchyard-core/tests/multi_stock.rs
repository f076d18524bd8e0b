//! Behavioural tests for the multi-lease stock used by the
//! multiplexed WAS variants.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use switchyard_core::hash::StringWithHash;
use switchyard_core::stock::StockError;
use switchyard_core::stock::multi::{
    MultiStockClass, MultiStockItem, MultiStockMap, MultiStockOptions,
};

struct MockChild {
    id: usize,
    faded: AtomicBool,
    destroyed: Arc<AtomicUsize>,
}

impl MultiStockItem for MockChild {
    fn fade(&self) {
        self.faded.store(true, Ordering::Relaxed);
    }

    fn is_faded(&self) -> bool {
        self.faded.load(Ordering::Relaxed)
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

struct MockClass {
    created: AtomicUsize,
    destroyed: Arc<AtomicUsize>,
    limit: usize,
    concurrency: usize,
    fail_remaining: AtomicUsize,
}

impl MockClass {
    fn new(limit: usize, concurrency: usize) -> Self {
        Self {
            created: AtomicUsize::new(0),
            destroyed: Arc::new(AtomicUsize::new(0)),
            limit,
            concurrency,
            fail_remaining: AtomicUsize::new(0),
        }
    }
}

impl MultiStockClass for MockClass {
    type Item = MockChild;
    type Request = ();
    type Error = std::io::Error;

    fn options(&self, _: &()) -> MultiStockOptions {
        MultiStockOptions {
            limit: self.limit,
            concurrency: self.concurrency,
            clear_interval: Duration::from_secs(900),
        }
    }

    async fn create(&self, _key: &StringWithHash, _: &()) -> Result<MockChild, std::io::Error> {
        tokio::time::sleep(Duration::from_millis(10)).await;

        if self
            .fail_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(std::io::Error::other("refused"));
        }

        Ok(MockChild {
            id: self.created.fetch_add(1, Ordering::Relaxed),
            faded: AtomicBool::new(false),
            destroyed: Arc::clone(&self.destroyed),
        })
    }
}

fn key(name: &str) -> StringWithHash {
    StringWithHash::new(name.to_owned())
}

#[tokio::test]
async fn leases_share_one_child_up_to_concurrency() {
    let stock = MultiStockMap::new(MockClass::new(1, 2));
    let k = key("app");

    let a = stock.get(&k, &()).await.expect("first");
    let b = stock.get(&k, &()).await.expect("second");

    /* both leases share the same child */
    assert_eq!(a.item().id, b.item().id);
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 1);

    /* a third lease has nowhere to go (limit 1, concurrency 2) */
    let stock2 = Arc::clone(&stock);
    let k2 = k.clone();
    let third = tokio::spawn(async move { stock2.get(&k2, &()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!third.is_finished());

    /* releasing one slot lets the third in, still on the same
       child */
    a.release();
    let c = third.await.expect("join").expect("third");
    assert_eq!(c.item().id, b.item().id);
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 1);

    b.release();
    c.release();
}

#[tokio::test]
async fn second_child_is_created_when_the_first_is_full() {
    let stock = MultiStockMap::new(MockClass::new(2, 2));
    let k = key("app");

    let a = stock.get(&k, &()).await.expect("1");
    let b = stock.get(&k, &()).await.expect("2");
    let c = stock.get(&k, &()).await.expect("3");

    assert_eq!(stock.class().created.load(Ordering::Relaxed), 2);
    assert_ne!(a.item().id, c.item().id);

    a.release();
    b.release();
    c.release();
}

#[tokio::test]
async fn concurrent_getters_share_one_pending_creation() {
    let stock = MultiStockMap::new(MockClass::new(4, 4));
    let k = key("app");

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let stock = Arc::clone(&stock);
        let k = k.clone();
        tasks.push(tokio::spawn(async move { stock.get(&k, &()).await }));
    }

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.expect("join").expect("get"));
    }

    /* all four fit into one child; no second spawn happened */
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 1);

    for lease in leases {
        lease.release();
    }
}

#[tokio::test]
async fn faded_child_is_destroyed_after_the_last_release() {
    let stock = MultiStockMap::new(MockClass::new(1, 2));
    let k = key("app");

    let a = stock.get(&k, &()).await.expect("first");
    let b = stock.get(&k, &()).await.expect("second");

    a.item().fade();
    a.release();
    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 0);

    b.release();
    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 1);

    /* a new get spawns a fresh child */
    let c = stock.get(&k, &()).await.expect("after fade");
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 2);
    c.release();
}

#[tokio::test]
async fn waiters_inherit_a_shared_spawn_failure() {
    let stock = MultiStockMap::new(MockClass::new(1, 4));
    let k = key("app");

    stock.class().fail_remaining.store(1, Ordering::Relaxed);

    let stock1 = Arc::clone(&stock);
    let k1 = k.clone();
    let first = tokio::spawn(async move { stock1.get(&k1, &()).await });

    tokio::time::sleep(Duration::from_millis(1)).await;
    let stock2 = Arc::clone(&stock);
    let k2 = k.clone();
    let second = tokio::spawn(async move { stock2.get(&k2, &()).await });

    let first = first.await.expect("join");
    let second = second.await.expect("join");

    assert!(matches!(first, Err(StockError::Shared(_))));
    assert!(matches!(second, Err(StockError::Shared(_))));
}

#[tokio::test]
async fn idle_child_is_evicted() {
    let stock = MultiStockMap::new(MockClass::new(2, 2));
    let k = key("app");

    let lease = stock.get(&k, &()).await.expect("get");
    lease.release();

    assert!(stock.discard_oldest_idle());
    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 1);
    assert!(!stock.discard_oldest_idle());
}
