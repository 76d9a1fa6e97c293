//! Directory-backed shared store
//!
//! Each key is a file in a shared directory; the file contents are the value.
//! Writes go to a temporary file first and are renamed into place, so readers
//! never observe a half-written value. Other processes' writes are detected
//! by polling the directory at a fixed interval.

use super::{
    NOTIFY_CAPACITY, Notification, SharedStore, StoreChange, StoreError, StoreResult,
    StoreSubscription,
};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default interval between directory scans
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Origin used for changes discovered on disk
const DISK_ORIGIN: Uuid = Uuid::nil();

#[derive(Debug)]
struct FileInner {
    dir: PathBuf,
    /// Last values seen on disk or written by this handle
    known: Mutex<HashMap<String, String>>,
    notify_tx: broadcast::Sender<Notification>,
}

/// Handle to a directory-backed shared store
#[derive(Debug)]
pub struct FileStore {
    inner: Arc<FileInner>,
    origin: Uuid,
    poller: Option<JoinHandle<()>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`
    ///
    /// When called inside a tokio runtime, a background task polls the
    /// directory every `poll_interval` and broadcasts foreign changes.
    /// Outside a runtime the store works but never notifies.
    pub fn open(dir: impl Into<PathBuf>, poll_interval: Duration) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Unavailable(format!(
                "Failed to create store directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let known = scan_dir(&dir)?;
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let inner = Arc::new(FileInner {
            dir,
            known: Mutex::new(known),
            notify_tx,
        });

        let poller = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(poll_loop(Arc::clone(&inner), poll_interval)));

        Ok(Self {
            inner,
            origin: Uuid::new_v4(),
            poller,
        })
    }

    /// Open with the default poll interval
    pub fn open_default(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open(dir, DEFAULT_POLL_INTERVAL)
    }

    /// Directory holding the key files
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn key_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.inner.dir.join(key))
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl SharedStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let path = self.key_path(key)?;
        read_value(&path)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let path = self.key_path(key)?;
        let tmp = self.inner.dir.join(format!(".{}.{}.tmp", key, self.origin));

        let mut known = self.inner.known.lock().unwrap_or_else(PoisonError::into_inner);
        fs::write(&tmp, value)
            .map_err(|e| StoreError::Io(format!("Failed to write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io(format!("Failed to replace {}: {}", path.display(), e))
        })?;
        known.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.key_path(key)?;

        let mut known = self.inner.known.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to remove {}: {}",
                    path.display(),
                    e
                )));
            }
        }
        known.remove(key);
        Ok(())
    }

    fn subscribe(&self) -> StoreSubscription {
        StoreSubscription::new(self.origin, self.inner.notify_tx.subscribe())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.dir.is_dir() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "Store directory {} is missing",
                self.inner.dir.display()
            )))
        }
    }
}

async fn poll_loop(inner: Arc<FileInner>, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let scan = Arc::clone(&inner);
        match tokio::task::spawn_blocking(move || sync_from_disk(&scan)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(dir = %inner.dir.display(), error = %e, "Store directory scan failed");
            }
            Err(e) => warn!(error = %e, "Store directory scan task failed"),
        }
    }
}

/// Diff the directory against what this handle last saw and broadcast changes
///
/// Blocking; holds `known` for the whole scan so a concurrent write through
/// this handle is never mistaken for a foreign one.
fn sync_from_disk(inner: &FileInner) -> StoreResult<usize> {
    let mut known = inner.known.lock().unwrap_or_else(PoisonError::into_inner);
    let current = scan_dir(&inner.dir)?;

    let mut changed = 0;
    let keys: BTreeSet<&String> = known.keys().chain(current.keys()).collect();
    for key in keys {
        let old_value = known.get(key).cloned();
        let new_value = current.get(key).cloned();
        if old_value != new_value {
            debug!(key = %key, "Store key changed on disk");
            changed += 1;
            let _ = inner.notify_tx.send(Notification {
                origin: DISK_ORIGIN,
                change: StoreChange {
                    key: key.clone(),
                    old_value,
                    new_value,
                },
            });
        }
    }
    *known = current;
    Ok(changed)
}

fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

fn read_value(path: &Path) -> StoreResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

fn scan_dir(dir: &Path) -> StoreResult<HashMap<String, String>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| StoreError::Io(format!("Failed to list {}: {}", dir.display(), e)))?;

    let mut values = HashMap::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if validate_key(&name).is_err() || !entry.path().is_file() {
            continue;
        }
        // A file removed between listing and reading is simply absent
        if let Some(value) = read_value(&entry.path())? {
            values.insert(name, value);
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_set_get_delete_roundtrip_on_disk() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open_default(temp.path().join("store")).unwrap();

        assert_eq!(store.get("lock_holder_id").unwrap(), None);
        store.set("lock_holder_id", "abc").unwrap();
        assert_eq!(
            fs::read_to_string(temp.path().join("store/lock_holder_id")).unwrap(),
            "abc"
        );
        assert_eq!(store.get("lock_holder_id").unwrap(), Some("abc".to_string()));

        store.delete("lock_holder_id").unwrap();
        assert_eq!(store.get("lock_holder_id").unwrap(), None);
        store.delete("lock_holder_id").unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open_default(temp.path()).unwrap();

        assert!(matches!(
            store.set("../escape", "x"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(store.get(".hidden"), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.delete(""), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_disk_sync_reports_only_foreign_changes() {
        let temp = TempDir::new().unwrap();
        // No runtime, so no background poller racing the manual syncs
        let store = FileStore::open_default(temp.path()).unwrap();
        assert!(store.poller.is_none());

        store.set("lock_holder_id", "me").unwrap();
        assert_eq!(sync_from_disk(&store.inner).unwrap(), 0);

        fs::write(temp.path().join("lock_request_id"), "waiter-1").unwrap();
        fs::remove_file(temp.path().join("lock_holder_id")).unwrap();
        assert_eq!(sync_from_disk(&store.inner).unwrap(), 2);
        assert_eq!(sync_from_disk(&store.inner).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_two_handles_see_each_others_writes() {
        let temp = TempDir::new().unwrap();
        let poll = Duration::from_millis(20);
        let a = FileStore::open(temp.path(), poll).unwrap();
        let b = FileStore::open(temp.path(), poll).unwrap();
        let mut b_events = b.subscribe();

        a.set("lock_request_id", "waiter-1").unwrap();

        let change = timeout(Duration::from_secs(5), b_events.recv())
            .await
            .expect("b should notice the write")
            .expect("channel open");
        assert_eq!(change.key, "lock_request_id");
        assert_eq!(change.new_value, Some("waiter-1".to_string()));
    }

    #[tokio::test]
    async fn test_own_writes_are_not_reported() {
        let temp = TempDir::new().unwrap();
        let a = FileStore::open(temp.path(), Duration::from_millis(20)).unwrap();
        let mut a_events = a.subscribe();

        a.set("lock_holder_id", "me").unwrap();
        a.delete("lock_holder_id").unwrap();

        assert!(
            timeout(Duration::from_millis(200), a_events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unavailable_when_directory_is_removed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("gone");
        let store = FileStore::open_default(&dir).unwrap();
        assert!(store.check_available().is_ok());

        fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(store.check_available(), Err(StoreError::Unavailable(_))));
    }
}
