//! In-process shared store
//!
//! A single backend is shared by any number of handles. Each handle stands
//! for one instance: it gets its own origin id, so notifications for its own
//! writes are never delivered back to it.

use super::{
    NOTIFY_CAPACITY, Notification, SharedStore, StoreChange, StoreError, StoreResult,
    StoreSubscription,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug)]
struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
    notify_tx: broadcast::Sender<Notification>,
    available: AtomicBool,
}

/// Handle to an in-memory shared store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    origin: Uuid,
}

impl MemoryStore {
    /// Create a new, empty store and return the first handle to it
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            backend: Arc::new(MemoryBackend {
                entries: RwLock::new(HashMap::new()),
                notify_tx,
                available: AtomicBool::new(true),
            }),
            origin: Uuid::new_v4(),
        }
    }

    /// Open another handle onto the same backend (a new "instance")
    pub fn connect(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            origin: Uuid::new_v4(),
        }
    }

    /// Enable or disable the whole backend
    pub fn set_available(&self, available: bool) {
        self.backend.available.store(available, Ordering::SeqCst);
    }

    /// Copy of every entry currently stored
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.backend
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.backend.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is disabled".to_string()))
        }
    }

    fn publish(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        if old_value == new_value {
            return;
        }
        // No receivers is fine
        let _ = self.backend.notify_tx.send(Notification {
            origin: self.origin,
            change: StoreChange {
                key: key.to_string(),
                old_value,
                new_value,
            },
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        let entries = self
            .backend
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let old_value = self
            .backend
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        self.publish(key, old_value, Some(value.to_string()));
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let old_value = self
            .backend
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.publish(key, old_value, None);
        Ok(())
    }

    fn subscribe(&self) -> StoreSubscription {
        StoreSubscription::new(self.origin, self.backend.notify_tx.subscribe())
    }

    fn check_available(&self) -> StoreResult<()> {
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_set_get_delete() {
        let store = MemoryStore::new();

        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v1").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v1".to_string()));

        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);

        // Deleting again is fine
        store.delete("k").unwrap();
    }

    #[test]
    fn test_handles_share_backend() {
        let a = MemoryStore::new();
        let b = a.connect();

        a.set("shared", "from-a").unwrap();
        assert_eq!(b.get("shared").unwrap(), Some("from-a".to_string()));
        assert_eq!(b.snapshot().len(), 1);
    }

    #[test]
    fn test_unavailable_store_rejects_everything() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(store.check_available(), Err(StoreError::Unavailable(_))));
        assert!(store.get("k").is_err());
        assert!(store.set("k", "v").is_err());
        assert!(store.delete("k").is_err());

        store.set_available(true);
        assert!(store.check_available().is_ok());
    }

    #[tokio::test]
    async fn test_notifications_skip_the_writer() {
        let a = MemoryStore::new();
        let b = a.connect();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.set("lock", "1").unwrap();

        let change = timeout(Duration::from_secs(1), b_events.recv())
            .await
            .expect("b should be notified")
            .expect("channel open");
        assert_eq!(
            change,
            StoreChange {
                key: "lock".to_string(),
                old_value: None,
                new_value: Some("1".to_string()),
            }
        );

        assert!(
            timeout(Duration::from_millis(50), a_events.recv())
                .await
                .is_err(),
            "writer must not see its own change"
        );
    }

    #[tokio::test]
    async fn test_unchanged_value_is_not_broadcast() {
        let a = MemoryStore::new();
        let b = a.connect();
        a.set("k", "same").unwrap();

        let mut b_events = b.subscribe();
        a.set("k", "same").unwrap();
        a.delete("k").unwrap();

        let change = b_events.recv().await.expect("channel open");
        assert_eq!(change.new_value, None);
        assert_eq!(change.old_value, Some("same".to_string()));
    }
}
