//! Shared key-value stores with change notification
//!
//! Every instance of the same logical client talks to one shared key space
//! through a [`SharedStore`] handle. Stores are plain last-writer-wins maps:
//! no transactions and no compare-and-swap. Each handle can subscribe to a
//! best-effort stream of changes made through *other* handles.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process backend, one handle per instance
//! - [`FileStore`]: one file per key in a shared directory, for separate
//!   processes on the same machine

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Capacity of each store's notification channel
pub(crate) const NOTIFY_CAPACITY: usize = 64;

/// Key read by the default availability check
const AVAILABILITY_KEY: &str = "__holdfast_available";

/// Store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The store is disabled or cannot be reached
    #[error("Shared store unavailable: {0}")]
    Unavailable(String),

    /// The key cannot be represented by this backend
    #[error("Invalid store key '{0}'")]
    InvalidKey(String),

    /// I/O error in a persistent backend
    #[error("Store I/O error: {0}")]
    Io(String),
}

/// A change to one key, as seen by other handles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// A change tagged with the handle that caused it
#[derive(Debug, Clone)]
pub(crate) struct Notification {
    pub origin: Uuid,
    pub change: StoreChange,
}

/// Shared key-value storage visible to every instance
pub trait SharedStore: Send + Sync + fmt::Debug {
    /// Read a value
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value, overwriting whatever was there
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Remove a value (no-op when absent)
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Subscribe to changes made through other handles
    fn subscribe(&self) -> StoreSubscription;

    /// Check that the store can be used at all
    fn check_available(&self) -> StoreResult<()> {
        self.get(AVAILABILITY_KEY).map(|_| ())
    }
}

/// Receiving end of a store's change notifications
///
/// Changes made through the subscribing handle itself are filtered out.
/// Slow receivers silently lose older changes.
#[derive(Debug)]
pub struct StoreSubscription {
    origin: Uuid,
    rx: broadcast::Receiver<Notification>,
}

impl StoreSubscription {
    pub(crate) fn new(origin: Uuid, rx: broadcast::Receiver<Notification>) -> Self {
        Self { origin, rx }
    }

    /// Wait for the next foreign change
    ///
    /// Returns `None` once the store has been dropped.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.recv().await {
                Ok(notification) if notification.origin == self.origin => continue,
                Ok(notification) => return Some(notification.change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "Store notifications coalesced");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
