//! Multi-instance session lock scenarios
//!
//! The in-memory tests run on tokio's paused clock, so the 5 s heartbeat and
//! 30 s stale timeout elapse instantly while keeping exact timings. The file
//! store test runs in real time against a temporary directory.

use holdfast_core::clock::{Clock, TokioClock};
use holdfast_core::domain::events::InMemoryEventStore;
use holdfast_core::domain::locking::{
    InstanceId, LockConfig, LockCoordinator, LockRecord, LockState, LockStatus, RequestRecord,
};
use holdfast_core::storage::{FileStore, MemoryStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};

const ORIGIN_MS: i64 = 1_700_000_000_000;
const SETTLE: Duration = Duration::from_millis(50);
const STALE_MS: i64 = 30_000;

/// One shared backend and one clock for every instance
struct Harness {
    store: MemoryStore,
    clock: Arc<TokioClock>,
    events: Arc<InMemoryEventStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            clock: Arc::new(TokioClock::with_origin(ORIGIN_MS)),
            events: Arc::new(InMemoryEventStore::new()),
        }
    }

    /// A new instance with its own store handle
    fn instance(&self) -> LockCoordinator {
        LockCoordinator::new(Arc::new(self.store.connect()), LockConfig::default())
            .with_clock(self.clock.clone())
            .with_publisher(self.events.clone())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn holder(&self) -> Option<String> {
        LockRecord::read(&self.store)
            .unwrap()
            .map(|record| record.holder_id)
    }

    fn event_count(&self, event_type: &str) -> usize {
        self.events.events_by_type(event_type).len()
    }
}

async fn noop() -> anyhow::Result<()> {
    Ok(())
}

async fn count_after(delay: Duration, calls: Arc<AtomicUsize>) -> anyhow::Result<()> {
    sleep(delay).await;
    calls.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn counted(
    calls: &Arc<AtomicUsize>,
) -> impl FnOnce() -> std::future::Ready<anyhow::Result<()>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(()))
    }
}

#[tokio::test(start_paused = true)]
async fn single_instance_on_clean_store_acquires() {
    let h = Harness::new();
    let lock = h.instance();
    let start = Instant::now();

    assert!(lock.acquire(noop).await.unwrap());

    assert!(start.elapsed() <= SETTLE * 2);
    assert_eq!(lock.state(), LockState::Holding);
    assert!(lock.id().matches(&h.holder().unwrap()));
    assert_eq!(h.event_count("lock_acquired"), 1);
}

#[tokio::test(start_paused = true)]
async fn sequential_instances_never_run_their_own_cleanup() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let lock = h.instance();
        assert!(lock.acquire(counted(&calls)).await.unwrap());
        sleep(Duration::from_secs(7)).await;
        lock.release().await;
        assert_eq!(lock.state(), LockState::Released);
        assert_eq!(h.holder(), None);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(h.store.snapshot().is_empty());
    assert_eq!(h.event_count("lock_released"), 3);
}

#[tokio::test(start_paused = true)]
async fn clean_shutdown_hands_off_quickly() {
    let h = Harness::new();
    let a = h.instance();
    let a_calls = Arc::new(AtomicUsize::new(0));
    assert!(a.acquire(counted(&a_calls)).await.unwrap());

    sleep(Duration::from_secs(2)).await;
    let b = h.instance();
    let start = Instant::now();
    assert!(b.acquire(noop).await.unwrap());
    let waited = start.elapsed();

    assert!(waited < Duration::from_secs(1), "handoff took {:?}", waited);
    a.wait_until_released().await;
    assert_eq!(a.state(), LockState::Released);
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);

    assert!(b.id().matches(&h.holder().unwrap()));
    assert_eq!(RequestRecord::read(&h.store).unwrap(), None);
    assert_eq!(h.event_count("lock_superseded"), 1);
    assert_eq!(h.event_count("lock_released"), 1);
    assert_eq!(h.event_count("lock_acquired"), 2);
}

#[tokio::test(start_paused = true)]
async fn crashed_holder_is_taken_over_after_stale_timeout() {
    let h = Harness::new();
    let a = h.instance();
    assert!(a.acquire(noop).await.unwrap());

    // One heartbeat at ~5 s, then the process dies
    sleep(Duration::from_millis(5_500)).await;
    let last_heartbeat = LockRecord::read(&h.store).unwrap().unwrap().last_heartbeat;
    assert!(last_heartbeat >= ORIGIN_MS + 5_000);
    let a_id = a.id();
    drop(a);

    sleep(Duration::from_millis(4_500)).await;
    let b = h.instance();
    assert!(b.acquire(noop).await.unwrap());
    let resolved_at = h.now_ms();

    // The watchdog wakes exactly at expiry rather than on its next 5 s tick
    assert!(resolved_at >= last_heartbeat + STALE_MS);
    let latest = last_heartbeat + STALE_MS + 2 * SETTLE.as_millis() as i64;
    assert!(resolved_at <= latest, "resolved {} ms after expiry", resolved_at - last_heartbeat - STALE_MS);

    let holder = h.holder().unwrap();
    assert!(b.id().matches(&holder));
    assert!(!a_id.matches(&holder));
    assert_eq!(RequestRecord::read(&h.store).unwrap(), None);
    assert_eq!(h.event_count("stale_lock_detected"), 1);
}

#[tokio::test(start_paused = true)]
async fn handoff_waits_for_slow_cleanup() {
    let h = Harness::new();
    let a = h.instance();
    let cleanup = Duration::from_secs(2);
    let calls = Arc::new(AtomicUsize::new(0));
    let a_calls = Arc::clone(&calls);
    assert!(
        a.acquire(move || count_after(cleanup, a_calls))
            .await
            .unwrap()
    );

    let b = h.instance();
    let start = Instant::now();
    assert!(b.acquire(noop).await.unwrap());
    let waited = start.elapsed();

    assert!(waited >= cleanup, "resolved after only {:?}", waited);
    assert!(waited < cleanup + Duration::from_secs(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(b.id().matches(&h.holder().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn abandoned_waiter_request_does_not_evict_next_holder() {
    let h = Harness::new();
    let a = h.instance();
    let calls = Arc::new(AtomicUsize::new(0));
    let a_calls = Arc::clone(&calls);
    assert!(
        a.acquire(move || count_after(Duration::from_secs(2), a_calls))
            .await
            .unwrap()
    );

    // The waiter is interrupted mid-wait and never comes back
    let w = h.instance();
    let interrupted = tokio::time::timeout(Duration::from_millis(200), w.acquire(noop)).await;
    assert!(interrupted.is_err());
    drop(w);

    a.wait_until_released().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.holder(), None);
    assert_eq!(RequestRecord::read(&h.store).unwrap(), None);

    sleep(Duration::from_secs(1)).await;
    let n = h.instance();
    let n_calls = Arc::new(AtomicUsize::new(0));
    assert!(n.acquire(counted(&n_calls)).await.unwrap());
    sleep(Duration::from_secs(6)).await;

    assert_eq!(n.state(), LockState::Holding);
    assert_eq!(n_calls.load(Ordering::SeqCst), 0);
    assert!(n.id().matches(&h.holder().unwrap()));
}

async fn timed_acquire(lock: &LockCoordinator, start: Instant) -> (bool, Duration) {
    let won = lock.acquire(noop).await.unwrap();
    (won, start.elapsed())
}

#[tokio::test(start_paused = true)]
async fn concurrent_requesters_one_backs_off() {
    let h = Harness::new();
    let a = h.instance();
    let a_calls = Arc::new(AtomicUsize::new(0));
    assert!(a.acquire(counted(&a_calls)).await.unwrap());

    let b = h.instance();
    let c = h.instance();
    let start = Instant::now();
    let ((b_won, b_elapsed), (c_won, c_elapsed)) =
        tokio::join!(timed_acquire(&b, start), timed_acquire(&c, start));

    assert_ne!(b_won, c_won, "exactly one requester should get the lock");
    let (winner, loser, loser_elapsed) = if b_won {
        (&b, &c, c_elapsed)
    } else {
        (&c, &b, b_elapsed)
    };
    assert!(loser_elapsed <= SETTLE * 2);
    assert_eq!(loser.state(), LockState::BackedOff);
    assert_eq!(winner.state(), LockState::Holding);
    assert!(winner.id().matches(&h.holder().unwrap()));

    a.wait_until_released().await;
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.event_count("lock_contention"), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_request_does_not_block_new_requester() {
    let h = Harness::new();
    let a = h.instance();
    assert!(a.acquire(noop).await.unwrap());

    let ghost = h.store.connect();
    RequestRecord::new(InstanceId::generate(), h.now_ms() - STALE_MS - 1)
        .write(&ghost)
        .unwrap();

    // The holder ignores the dead request
    sleep(Duration::from_secs(6)).await;
    assert_eq!(a.state(), LockState::Holding);

    let b = h.instance();
    assert!(b.acquire(noop).await.unwrap());
    assert!(b.id().matches(&h.holder().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_runs_cleanup_then_releases() {
    let h = Harness::new();
    let a = h.instance();
    let calls = Arc::new(AtomicUsize::new(0));
    assert!(a.acquire(counted(&calls)).await.unwrap());

    a.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.state(), LockState::Released);
    assert_eq!(h.holder(), None);
}

#[tokio::test(start_paused = true)]
async fn failing_or_panicking_cleanup_still_releases() {
    async fn fail() -> anyhow::Result<()> {
        Err(anyhow::anyhow!("flush failed"))
    }
    async fn explode() -> anyhow::Result<()> {
        panic!("cleanup exploded")
    }

    let h = Harness::new();

    let a = h.instance();
    assert!(a.acquire(fail).await.unwrap());
    a.shutdown().await;
    assert_eq!(h.holder(), None);

    let b = h.instance();
    assert!(b.acquire(explode).await.unwrap());
    b.shutdown().await;
    assert_eq!(b.state(), LockState::Released);
    assert_eq!(h.holder(), None);
}

#[tokio::test(start_paused = true)]
async fn usurped_holder_cleans_up_without_clearing_record() {
    let h = Harness::new();
    let a = h.instance();
    let calls = Arc::new(AtomicUsize::new(0));
    assert!(a.acquire(counted(&calls)).await.unwrap());

    let intruder = InstanceId::generate();
    LockRecord::new(intruder, h.now_ms())
        .write(&h.store.connect())
        .unwrap();

    sleep(Duration::from_secs(6)).await;

    assert_eq!(a.state(), LockState::Released);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(intruder.matches(&h.holder().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn inspect_reports_holder_from_both_sides() {
    let h = Harness::new();
    let a = h.instance();
    let b = h.instance();
    assert_eq!(a.inspect().unwrap().status, LockStatus::Available);

    assert!(a.acquire(noop).await.unwrap());
    sleep(Duration::from_secs(1)).await;

    assert_eq!(a.inspect().unwrap().status, LockStatus::HeldBySelf);
    let seen_by_b = b.inspect().unwrap();
    assert_eq!(seen_by_b.status, LockStatus::HeldByOther);
    assert_eq!(
        seen_by_b.holder.map(|record| record.holder_id),
        Some(a.id().to_string())
    );
    let age = seen_by_b.heartbeat_age_ms.unwrap();
    assert!((1_000..5_000).contains(&age), "heartbeat age {}", age);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_store_instances_hand_off_through_polling() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(TokioClock::with_origin(ORIGIN_MS));
    let open = || {
        let store = FileStore::open(dir.path(), Duration::from_millis(20)).unwrap();
        LockCoordinator::new(Arc::new(store), LockConfig::default()).with_clock(clock.clone())
    };

    let a = open();
    let b = open();
    assert!(a.acquire(noop).await.unwrap());

    let start = Instant::now();
    assert!(b.acquire(noop).await.unwrap());

    // Well inside one heartbeat, so the handoff came from the directory poll
    assert!(start.elapsed() < Duration::from_secs(4));
    a.wait_until_released().await;
    assert_eq!(a.state(), LockState::Released);
    assert_eq!(b.inspect().unwrap().status, LockStatus::HeldBySelf);
}
