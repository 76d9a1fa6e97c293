//! Holder task: heartbeat and cooperative handoff
//!
//! Spawned once an instance claims the lock. It refreshes the heartbeat every
//! `heartbeat_interval` and watches for anything that should make it let go:
//! a request from another instance, a stop signal from the coordinator, or
//! the discovery that someone else has taken the record over.

use super::coordinator::Protocol;
use super::event::LockEvent;
use super::types::{LOCK_LAST_HEARTBEAT_KEY, LOCK_REQUEST_ID_KEY, LockRecord, LockState};
use crate::storage::{StoreResult, StoreSubscription};
use std::future::Future;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Stop request sent from the coordinator to its holder task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    /// Clean release; the caller is done with the lock
    Release,
    /// The execution context is shutting down
    Shutdown,
}

/// Why the holder is letting go
#[derive(Debug, Clone, PartialEq, Eq)]
enum Supersession {
    Requested(String),
    Shutdown,
    Release,
    Usurped(Option<String>),
}

impl Supersession {
    fn reason(&self) -> &'static str {
        match self {
            Self::Requested(_) => "requested",
            Self::Shutdown => "shutdown",
            Self::Release => "release",
            Self::Usurped(_) => "usurped",
        }
    }

    fn runs_cleanup(&self) -> bool {
        !matches!(self, Self::Release)
    }

    fn clears_record(&self) -> bool {
        !matches!(self, Self::Usurped(_))
    }
}

enum Beat {
    Refreshed,
    Lost(Option<String>),
}

impl Protocol {
    pub(crate) async fn hold<F, Fut>(
        self,
        mut changes: StoreSubscription,
        mut stop_rx: watch::Receiver<Option<StopSignal>>,
        on_superseded: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let held_since = Instant::now();
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(held_since + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notifications_open = true;

        let supersession = loop {
            tokio::select! {
                _ = heartbeat.tick() => match self.beat() {
                    Ok(Beat::Refreshed) => {
                        // Polling fallback for a request notification we never got
                        if let Some(requester) = self.pending_request() {
                            break Supersession::Requested(requester);
                        }
                    }
                    Ok(Beat::Lost(current)) => break Supersession::Usurped(current),
                    Err(e) => {
                        warn!(instance_id = %self.id, error = %e, "Failed to refresh session lock heartbeat");
                    }
                },
                change = changes.recv(), if notifications_open => match change {
                    Some(change) if change.key == LOCK_REQUEST_ID_KEY => {
                        if let Some(requester) = self.pending_request() {
                            break Supersession::Requested(requester);
                        }
                    }
                    Some(_) => {}
                    None => notifications_open = false,
                },
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        // Coordinator is gone; behave like a crash
                        return;
                    }
                    match *stop_rx.borrow_and_update() {
                        Some(StopSignal::Release) => break Supersession::Release,
                        Some(StopSignal::Shutdown) => break Supersession::Shutdown,
                        None => {}
                    }
                }
            }
        };

        // No heartbeat past this point
        drop(heartbeat);
        self.hand_off(supersession, on_superseded, held_since).await;
    }

    fn beat(&self) -> StoreResult<Beat> {
        match LockRecord::read(self.store.as_ref())? {
            Some(record) if self.id.matches(&record.holder_id) => {
                self.store
                    .set(LOCK_LAST_HEARTBEAT_KEY, &self.now_ms().to_string())?;
                Ok(Beat::Refreshed)
            }
            other => Ok(Beat::Lost(other.map(|r| r.holder_id))),
        }
    }

    fn pending_request(&self) -> Option<String> {
        match self.foreign_request() {
            Ok(requester) => requester,
            Err(e) => {
                warn!(instance_id = %self.id, error = %e, "Failed to read lock request");
                None
            }
        }
    }

    async fn hand_off<F, Fut>(&self, supersession: Supersession, on_superseded: F, held_since: Instant)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.set_state(LockState::Releasing);

        match &supersession {
            Supersession::Requested(requester) => info!(
                instance_id = %self.id,
                requester = %requester,
                "Another instance requested the session lock, handing off"
            ),
            Supersession::Shutdown => {
                info!(instance_id = %self.id, "Shutting down, handing off session lock")
            }
            Supersession::Release => debug!(instance_id = %self.id, "Releasing session lock"),
            Supersession::Usurped(current) => warn!(
                instance_id = %self.id,
                current_holder = ?current,
                "Session lock was taken over by another instance"
            ),
        }

        if supersession.runs_cleanup() {
            self.publish(LockEvent::lock_superseded(self.id, supersession.reason()))
                .await;

            // Own task so a panicking cleanup cannot skip the release below
            match tokio::spawn(on_superseded()).await {
                Ok(Ok(())) => debug!(instance_id = %self.id, "Handoff cleanup finished"),
                Ok(Err(e)) => warn!(
                    instance_id = %self.id,
                    error = %e,
                    "Handoff cleanup failed, releasing anyway"
                ),
                Err(e) => warn!(
                    instance_id = %self.id,
                    error = %e,
                    "Handoff cleanup panicked, releasing anyway"
                ),
            }
        }

        if supersession.clears_record() {
            let held_ms = u64::try_from(held_since.elapsed().as_millis()).unwrap_or(u64::MAX);
            match self.release_record() {
                Ok(true) => {
                    info!(instance_id = %self.id, held_ms = held_ms, "Session lock released");
                    self.publish(LockEvent::lock_released(self.id, held_ms))
                        .await;
                }
                Ok(false) => debug!(
                    instance_id = %self.id,
                    "Lock record already belongs to another instance"
                ),
                Err(e) => warn!(
                    instance_id = %self.id,
                    error = %e,
                    "Failed to release session lock, it will expire"
                ),
            }
        }

        self.set_state(LockState::Released);
    }
}
