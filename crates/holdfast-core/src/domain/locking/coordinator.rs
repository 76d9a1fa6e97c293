//! Session lock coordinator
//!
//! The coordinator is the only entry point into the lock protocol. It turns a
//! last-writer-wins key-value store into an advisory lock:
//! - claims are verified by re-reading after `claim_settle`
//! - a single request slot arbitrates between waiters (losers back off)
//! - waiters react to store notifications and fall back to a watchdog that
//!   wakes when the holder's heartbeat would go stale
//! - the holder heartbeats and hands off when a request or shutdown arrives

use super::event::LockEvent;
use super::holder::StopSignal;
use super::types::{
    InstanceId, LOCK_HOLDER_ID_KEY, LOCK_REQUEST_ID_KEY, LockConfig, LockError, LockRecord,
    LockResult, LockSnapshot, LockState, RequestRecord, read_snapshot,
};
use crate::clock::{Clock, SystemClock};
use crate::domain::events::EventPublisher;
use crate::storage::{SharedStore, StoreResult, StoreSubscription};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, warn};

/// State shared between the acquiring caller and the holder task
#[derive(Clone)]
pub(crate) struct Protocol {
    pub(crate) id: InstanceId,
    pub(crate) store: Arc<dyn SharedStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: LockConfig,
    pub(crate) publisher: Option<Arc<dyn EventPublisher>>,
    pub(crate) state_tx: Arc<watch::Sender<LockState>>,
}

/// How a wait ended
enum WaitOutcome {
    Claimed,
    Outbid(String),
}

impl Protocol {
    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn set_state(&self, state: LockState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(instance_id = %self.id, state = %state, "Lock state changed");
        }
    }

    pub(crate) async fn publish(&self, event: LockEvent) {
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(&event).await {
                debug!(error = %e, event = %event.event_type, "Failed to publish lock event");
            }
        }
    }

    /// Write our record if the lock is vacant, then verify after settling
    async fn try_claim(&self) -> StoreResult<bool> {
        let now = self.now_ms();
        let stale_ms = self.config.stale_timeout_ms();

        if let Some(record) = LockRecord::read(self.store.as_ref())? {
            if !self.id.matches(&record.holder_id) {
                if !record.is_stale(now, stale_ms) {
                    return Ok(false);
                }
                let age_ms = record.age_ms(now);
                warn!(
                    instance_id = %self.id,
                    stale_holder = %record.holder_id,
                    age_ms = age_ms,
                    "Taking over stale session lock"
                );
                self.publish(LockEvent::stale_lock_detected(self.id, &record.holder_id, age_ms))
                    .await;
            }
        }

        self.set_state(LockState::Claiming);
        LockRecord::new(self.id, now).write(self.store.as_ref())?;
        sleep(self.config.claim_settle).await;

        match LockRecord::read(self.store.as_ref())? {
            Some(record) if self.id.matches(&record.holder_id) => Ok(true),
            other => {
                debug!(
                    instance_id = %self.id,
                    winner = ?other.map(|r| r.holder_id),
                    "Lost simultaneous claim"
                );
                Ok(false)
            }
        }
    }

    /// The live requester occupying the slot, if it is not us
    pub(crate) fn foreign_request(&self) -> StoreResult<Option<String>> {
        let now = self.now_ms();
        let stale_ms = self.config.stale_timeout_ms();
        Ok(RequestRecord::read(self.store.as_ref())?
            .filter(|r| !self.id.matches(&r.requester_id) && !r.is_stale(now, stale_ms))
            .map(|r| r.requester_id))
    }

    /// Take the request slot; returns the competitor when we must back off
    async fn register_request(&self) -> StoreResult<Option<String>> {
        if let Some(competitor) = self.foreign_request()? {
            return Ok(Some(competitor));
        }

        RequestRecord::new(self.id, self.now_ms()).write(self.store.as_ref())?;
        self.set_state(LockState::Waiting);
        debug!(instance_id = %self.id, "Requested session lock");

        sleep(self.config.claim_settle).await;
        self.foreign_request()
    }

    /// Keep our request from ageing out while we wait
    fn refresh_request(&self) {
        let refresh = || -> StoreResult<()> {
            match RequestRecord::read(self.store.as_ref())? {
                Some(r)
                    if !self.id.matches(&r.requester_id)
                        && !r.is_stale(self.now_ms(), self.config.stale_timeout_ms()) =>
                {
                    Ok(())
                }
                _ => RequestRecord::new(self.id, self.now_ms()).write(self.store.as_ref()),
            }
        };
        if let Err(e) = refresh() {
            warn!(instance_id = %self.id, error = %e, "Failed to refresh lock request");
        }
    }

    /// Attempt a claim from the waiting state, tidying up on success
    async fn claim_from_wait(&self) -> StoreResult<bool> {
        if !self.try_claim().await? {
            self.set_state(LockState::Waiting);
            return Ok(false);
        }

        let clear_own_request = || -> StoreResult<()> {
            if RequestRecord::read(self.store.as_ref())?
                .is_some_and(|r| self.id.matches(&r.requester_id))
            {
                RequestRecord::clear(self.store.as_ref())?;
            }
            Ok(())
        };
        if let Err(e) = clear_own_request() {
            warn!(instance_id = %self.id, error = %e, "Failed to clear own lock request");
        }
        Ok(true)
    }

    /// Time until the next staleness check
    ///
    /// Wakes exactly when the observed heartbeat expires, but never sleeps
    /// longer than the watchdog interval.
    fn watchdog_delay(&self) -> Duration {
        let max = self.config.watchdog_interval;
        match LockRecord::read(self.store.as_ref()) {
            Ok(Some(record)) => {
                let remaining = record
                    .expires_at(self.config.stale_timeout_ms())
                    .saturating_sub(self.now_ms());
                Duration::from_millis(u64::try_from(remaining).unwrap_or(0)).min(max)
            }
            Ok(None) => Duration::ZERO,
            Err(e) => {
                warn!(instance_id = %self.id, error = %e, "Watchdog failed to read lock record");
                max
            }
        }
    }

    async fn wait_for_vacancy(&self, changes: &mut StoreSubscription) -> WaitOutcome {
        let mut notifications_open = true;

        loop {
            let deadline = Instant::now() + self.watchdog_delay();

            let attempt = tokio::select! {
                change = changes.recv(), if notifications_open => {
                    let Some(change) = change else {
                        debug!(instance_id = %self.id, "Store notifications closed, polling only");
                        notifications_open = false;
                        continue;
                    };
                    // Some backends echo our own writes back
                    if change.new_value.as_deref().is_some_and(|v| self.id.matches(v)) {
                        continue;
                    }
                    match change.key.as_str() {
                        LOCK_REQUEST_ID_KEY => match self.foreign_request() {
                            Ok(Some(competitor)) => return WaitOutcome::Outbid(competitor),
                            Ok(None) => continue,
                            Err(e) => Err(e),
                        },
                        LOCK_HOLDER_ID_KEY => self.claim_from_wait().await,
                        _ => continue,
                    }
                }
                _ = sleep_until(deadline) => {
                    match self.foreign_request() {
                        Ok(Some(competitor)) => return WaitOutcome::Outbid(competitor),
                        Ok(None) => {
                            self.refresh_request();
                            self.claim_from_wait().await
                        }
                        Err(e) => Err(e),
                    }
                }
            };

            match attempt {
                Ok(true) => return WaitOutcome::Claimed,
                Ok(false) => {}
                Err(e) => {
                    warn!(instance_id = %self.id, error = %e, "Store error while waiting for session lock");
                    self.set_state(LockState::Waiting);
                    sleep(self.config.watchdog_interval).await;
                }
            }
        }
    }

    /// Clear the lock record if it is still ours
    ///
    /// The request slot goes with it: whoever asked has either claimed by the
    /// time it notices the vacancy or is gone, and a request left behind would
    /// evict the next holder.
    pub(crate) fn release_record(&self) -> StoreResult<bool> {
        let ours = self
            .store
            .get(LOCK_HOLDER_ID_KEY)?
            .is_some_and(|holder| self.id.matches(&holder));
        if ours {
            RequestRecord::clear(self.store.as_ref())?;
            LockRecord::clear(self.store.as_ref())?;
        }
        Ok(ours)
    }
}

/// Coordinates one instance's claim on the shared session lock
///
/// Create one coordinator per running instance and call [`acquire`] once.
/// Dropping the coordinator stops its heartbeat without releasing, exactly
/// like a crash; the record then ages out after the stale timeout.
///
/// [`acquire`]: LockCoordinator::acquire
pub struct LockCoordinator {
    protocol: Protocol,
    stop_tx: watch::Sender<Option<StopSignal>>,
    holder_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl LockCoordinator {
    /// Create a coordinator with a fresh instance id and the wall clock
    pub fn new(store: Arc<dyn SharedStore>, config: LockConfig) -> Self {
        let (state_tx, _) = watch::channel(LockState::Idle);
        let (stop_tx, _) = watch::channel(None);

        Self {
            protocol: Protocol {
                id: InstanceId::generate(),
                store,
                clock: Arc::new(SystemClock),
                config,
                publisher: None,
                state_tx: Arc::new(state_tx),
            },
            stop_tx,
            holder_task: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Create a coordinator with default timings
    pub fn with_defaults(store: Arc<dyn SharedStore>) -> Self {
        Self::new(store, LockConfig::default())
    }

    /// Use a different time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.protocol.clock = clock;
        self
    }

    /// Publish lock events to `publisher`
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.protocol.publisher = Some(publisher);
        self
    }

    /// This instance's id
    pub fn id(&self) -> InstanceId {
        self.protocol.id
    }

    /// Get the configuration
    pub fn config(&self) -> &LockConfig {
        &self.protocol.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> LockState {
        *self.protocol.state_tx.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<LockState> {
        self.protocol.state_tx.subscribe()
    }

    /// Whether this instance currently holds the lock
    pub fn is_holding(&self) -> bool {
        self.state() == LockState::Holding
    }

    /// Read the shared lock keys as seen by this instance
    pub fn inspect(&self) -> LockResult<LockSnapshot> {
        let p = &self.protocol;
        Ok(read_snapshot(
            p.store.as_ref(),
            p.now_ms(),
            p.config.stale_timeout_ms(),
            Some(p.id),
        )?)
    }

    /// Acquire the session lock
    ///
    /// Resolves `Ok(true)` once this instance holds the lock, or `Ok(false)`
    /// when another waiter already owns the request slot; a backed-off caller
    /// should not retry on its own. There is no timeout: a waiter stays
    /// suspended until it claims or is outbid.
    ///
    /// `on_superseded` runs when the held lock must be given up (another
    /// instance asked for it, [`shutdown`] was called, or a stale takeover
    /// happened). The record is cleared after it completes, whether it
    /// succeeded or not.
    ///
    /// [`shutdown`]: LockCoordinator::shutdown
    pub async fn acquire<F, Fut>(&self, on_superseded: F) -> LockResult<bool>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LockError::AlreadyStarted(self.id().to_string()));
        }

        let p = &self.protocol;
        p.store.check_available()?;
        p.config.validate()?;

        let started = Instant::now();
        let mut changes = p.store.subscribe();
        debug!(instance_id = %p.id, "Acquiring session lock");

        let outcome = if p.try_claim().await? {
            WaitOutcome::Claimed
        } else {
            match p.register_request().await? {
                Some(competitor) => WaitOutcome::Outbid(competitor),
                None => {
                    info!(instance_id = %p.id, "Session lock is held elsewhere, waiting");
                    p.wait_for_vacancy(&mut changes).await
                }
            }
        };

        let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match outcome {
            WaitOutcome::Outbid(competitor) => {
                p.set_state(LockState::BackedOff);
                info!(
                    instance_id = %p.id,
                    requester = %competitor,
                    "Another instance is already waiting for the session lock, backing off"
                );
                p.publish(LockEvent::lock_contention(p.id, Some(&competitor)))
                    .await;
                Ok(false)
            }
            WaitOutcome::Claimed => {
                p.set_state(LockState::Holding);
                info!(instance_id = %p.id, elapsed_ms = waited_ms, "Session lock acquired");
                p.publish(LockEvent::lock_acquired(p.id, waited_ms)).await;

                let task = tokio::spawn(p.clone().hold(
                    changes,
                    self.stop_tx.subscribe(),
                    on_superseded,
                ));
                *self
                    .holder_task
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(task);
                Ok(true)
            }
        }
    }

    /// Release the lock without running `on_superseded`
    pub async fn release(&self) {
        self.stop(StopSignal::Release).await;
    }

    /// Graceful shutdown: run `on_superseded`, then release
    pub async fn shutdown(&self) {
        self.stop(StopSignal::Shutdown).await;
    }

    /// Abrupt teardown: release immediately and synchronously
    ///
    /// `on_superseded` is not awaited. The release is best effort; if it is
    /// lost, waiters recover through the stale timeout.
    pub fn shutdown_abrupt(&self) {
        let Some(task) = self.take_holder_task() else {
            return;
        };
        task.abort();

        let p = &self.protocol;
        match p.release_record() {
            Ok(true) => info!(instance_id = %p.id, "Session lock released on abrupt shutdown"),
            Ok(false) => {}
            Err(e) => warn!(
                instance_id = %p.id,
                error = %e,
                "Failed to release session lock on abrupt shutdown, it will expire"
            ),
        }
        p.set_state(LockState::Released);
    }

    /// Wait until this instance has given the lock up
    ///
    /// Returns immediately if the lock was never held.
    pub async fn wait_until_released(&self) {
        let mut state = self.subscribe_state();
        // The sender lives as long as `self`, so this cannot fail
        let _ = state
            .wait_for(|s| s.is_terminal() || *s == LockState::Idle)
            .await;
    }

    async fn stop(&self, signal: StopSignal) {
        let Some(task) = self.take_holder_task() else {
            return;
        };
        self.stop_tx.send_replace(Some(signal));
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!(instance_id = %self.id(), error = %e, "Session lock holder task failed");
            }
        }
    }

    fn take_holder_task(&self) -> Option<JoinHandle<()>> {
        self.holder_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for LockCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.take_holder_task() {
            task.abort();
        }
    }
}

impl fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("id", &self.protocol.id)
            .field("state", &self.state())
            .field("config", &self.protocol.config)
            .finish_non_exhaustive()
    }
}
