//! Behavioural tests for the keyed stock: key reuse, the parallelism
//! cap, fades and eviction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use switchyard_core::hash::StringWithHash;
use switchyard_core::stock::{StockClass, StockError, StockItem, StockMap, StockOptions};

struct MockItem {
    id: usize,
    tag: String,
    faded: AtomicBool,
    destroyed: Arc<AtomicUsize>,
}

impl StockItem for MockItem {
    fn fade(&self) {
        self.faded.store(true, Ordering::Relaxed);
    }

    fn is_faded(&self) -> bool {
        self.faded.load(Ordering::Relaxed)
    }

    fn tag(&self) -> String {
        self.tag.clone()
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

struct MockClass {
    created: AtomicUsize,
    destroyed: Arc<AtomicUsize>,
    limit: usize,
    create_delay: Duration,
    fail_remaining: AtomicUsize,
    tag: parking_lot::Mutex<String>,
}

impl MockClass {
    fn new(limit: usize) -> Self {
        Self {
            created: AtomicUsize::new(0),
            destroyed: Arc::new(AtomicUsize::new(0)),
            limit,
            create_delay: Duration::from_millis(10),
            fail_remaining: AtomicUsize::new(0),
            tag: parking_lot::Mutex::new(String::new()),
        }
    }
}

impl StockClass for MockClass {
    type Item = MockItem;
    type Request = ();
    type Error = std::io::Error;

    fn options(&self, _: &()) -> StockOptions {
        StockOptions {
            limit: self.limit,
            clear_interval: Duration::from_secs(600),
        }
    }

    async fn create(
        &self,
        _key: &StringWithHash,
        _: &(),
    ) -> Result<MockItem, std::io::Error> {
        tokio::time::sleep(self.create_delay).await;

        if self
            .fail_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(std::io::Error::other("refused"));
        }

        Ok(MockItem {
            id: self.created.fetch_add(1, Ordering::Relaxed),
            tag: self.tag.lock().clone(),
            faded: AtomicBool::new(false),
            destroyed: Arc::clone(&self.destroyed),
        })
    }
}

fn key(name: &str) -> StringWithHash {
    StringWithHash::new(name.to_owned())
}

#[tokio::test]
async fn idle_item_is_reused() {
    let stock = StockMap::new(MockClass::new(2));
    let k = key("app");

    let first = stock.get(&k, &()).await.expect("first get");
    let first_id = first.item().id;
    first.release(true);

    let second = stock.get(&k, &()).await.expect("second get");
    assert_eq!(second.item().id, first_id);

    /* exactly one creation in total */
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn release_without_reuse_destroys() {
    let stock = StockMap::new(MockClass::new(2));
    let k = key("app");

    let lease = stock.get(&k, &()).await.expect("get");
    lease.release(false);

    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 1);

    let lease = stock.get(&k, &()).await.expect("get");
    assert_eq!(lease.item().id, 1);
}

#[tokio::test]
async fn parallelism_cap_makes_third_caller_wait() {
    let stock = StockMap::new(MockClass::new(2));
    let k = key("app");

    let a = stock.get(&k, &()).await.expect("first");
    let b = stock.get(&k, &()).await.expect("second");
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 2);

    let stock2 = Arc::clone(&stock);
    let k2 = k.clone();
    let third = tokio::spawn(async move { stock2.get(&k2, &()).await });

    /* the third caller must not trigger another creation */
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!third.is_finished());
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 2);

    /* finishing one lease lets the third continue without a spawn */
    a.release(true);
    let lease = third.await.expect("join").expect("third get");
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 2);

    lease.release(true);
    b.release(true);
}

#[tokio::test]
async fn get_no_wait_fails_at_limit() {
    let stock = StockMap::new(MockClass::new(1));
    let k = key("app");

    let lease = stock.get(&k, &()).await.expect("get");

    match stock.get_no_wait(&k, &()).await {
        Err(StockError::LimitExceeded) => {}
        _ => panic!("expected LimitExceeded"),
    }

    lease.release(true);
}

#[tokio::test]
async fn create_error_releases_the_slot() {
    let stock = StockMap::new(MockClass::new(1));
    let k = key("app");

    stock.class().fail_remaining.store(1, Ordering::Relaxed);
    assert!(stock.get(&k, &()).await.is_err());

    let lease = stock.get(&k, &()).await.expect("get after failure");
    lease.release(true);
}

#[tokio::test]
async fn queued_waiter_retries_after_create_error() {
    let stock = StockMap::new(MockClass::new(1));
    let k = key("app");

    stock.class().fail_remaining.store(1, Ordering::Relaxed);

    let stock2 = Arc::clone(&stock);
    let k2 = k.clone();
    let first = tokio::spawn(async move { stock2.get(&k2, &()).await });

    /* queue a second caller behind the failing creation */
    tokio::time::sleep(Duration::from_millis(1)).await;
    let stock3 = Arc::clone(&stock);
    let k3 = k.clone();
    let second = tokio::spawn(async move { stock3.get(&k3, &()).await });

    assert!(first.await.expect("join").is_err());

    /* the waiter retries with a fresh creation and succeeds */
    let lease = second.await.expect("join").expect("second get");
    lease.release(true);
}

#[tokio::test]
async fn cancelled_waiter_does_not_consume_the_slot() {
    let stock = StockMap::new(MockClass::new(1));
    let k = key("app");

    let lease = stock.get(&k, &()).await.expect("get");

    let stock2 = Arc::clone(&stock);
    let k2 = k.clone();
    let waiter = tokio::spawn(async move { stock2.get(&k2, &()).await });
    tokio::time::sleep(Duration::from_millis(5)).await;
    waiter.abort();
    let _ = waiter.await;

    /* releasing must not hand the item to the dead waiter */
    lease.release(true);

    let lease = stock.get(&k, &()).await.expect("get after cancel");
    assert_eq!(stock.class().created.load(Ordering::Relaxed), 1);
    lease.release(true);
}

#[tokio::test]
async fn fade_tag_destroys_matching_idle_items() {
    let stock = StockMap::new(MockClass::new(4));

    *stock.class().tag.lock() = "v1".to_owned();
    let v1 = stock.get(&key("v1-app"), &()).await.expect("v1 get");

    *stock.class().tag.lock() = "v2".to_owned();
    let v2 = stock.get(&key("v2-app"), &()).await.expect("v2 get");

    v1.release(true);
    v2.release(true);

    stock.fade_tag("v1");

    /* the v1 item is gone; a new get spawns a fresh process */
    let created_before = stock.class().created.load(Ordering::Relaxed);
    let v1 = stock.get(&key("v1-app"), &()).await.expect("v1 get again");
    assert_eq!(
        stock.class().created.load(Ordering::Relaxed),
        created_before + 1
    );
    v1.release(true);

    /* the v2 item is still idle and reused */
    let v2 = stock.get(&key("v2-app"), &()).await.expect("v2 get again");
    assert_eq!(
        stock.class().created.load(Ordering::Relaxed),
        created_before + 1
    );
    v2.release(true);
}

#[tokio::test]
async fn fade_tag_flags_busy_items() {
    let stock = StockMap::new(MockClass::new(4));

    *stock.class().tag.lock() = "v1".to_owned();
    let lease = stock.get(&key("app"), &()).await.expect("get");

    stock.fade_tag("v1");

    /* the busy item is destroyed on release instead of idling */
    lease.release(true);
    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn discard_oldest_idle_evicts_in_order() {
    let stock = StockMap::new(MockClass::new(4));

    let a = stock.get(&key("a"), &()).await.expect("a");
    let b = stock.get(&key("b"), &()).await.expect("b");

    /* release a first, so it is the oldest idle item */
    a.release(true);
    tokio::time::sleep(Duration::from_millis(2)).await;
    b.release(true);

    assert!(stock.has_idle());

    assert!(stock.discard_oldest_idle());
    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 1);

    assert!(stock.discard_oldest_idle());
    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 2);

    /* nothing left */
    assert!(!stock.discard_oldest_idle());
    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn stats_count_busy_and_idle() {
    let stock = StockMap::new(MockClass::new(4));

    let a = stock.get(&key("a"), &()).await.expect("a");
    let b = stock.get(&key("b"), &()).await.expect("b");
    b.release(true);

    let stats = stock.stats();
    assert_eq!(stats.busy, 1);
    assert_eq!(stats.idle, 1);

    a.release(true);
}

#[tokio::test(start_paused = true)]
async fn idle_ttl_expires_items() {
    let stock = StockMap::new(MockClass::new(4));

    let lease = stock.get(&key("app"), &()).await.expect("get");
    lease.release(true);
    assert!(stock.has_idle());

    tokio::time::sleep(Duration::from_secs(601)).await;

    assert!(!stock.has_idle());
    assert_eq!(stock.class().destroyed.load(Ordering::Relaxed), 1);
}
