//! Lock records, states, and error definitions

use crate::storage::{SharedStore, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Store key holding the current holder's instance id
pub const LOCK_HOLDER_ID_KEY: &str = "lock_holder_id";
/// Store key holding the holder's last heartbeat (epoch millis)
pub const LOCK_LAST_HEARTBEAT_KEY: &str = "lock_last_heartbeat";
/// Store key holding the pending requester's instance id
pub const LOCK_REQUEST_ID_KEY: &str = "lock_request_id";
/// Store key holding when the pending request was made (epoch millis)
pub const LOCK_REQUEST_AT_KEY: &str = "lock_request_at";

/// How often the holder refreshes its heartbeat
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Heartbeat age at which a holder is presumed dead
pub const STALE_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest a waiter goes between staleness checks
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
/// Delay between a claim write and its verifying re-read
pub const CLAIM_SETTLE: Duration = Duration::from_millis(50);

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock errors
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// `acquire` may only run once per coordinator
    #[error("Lock acquisition already started for instance {0}")]
    AlreadyStarted(String),

    /// The shared store cannot be used, so no coordination is possible
    #[error("Session lock unavailable: {0}")]
    StoreUnavailable(String),

    /// Timing configuration is unusable
    #[error("Invalid lock configuration: {0}")]
    InvalidConfig(String),
}

impl LockError {
    /// Get error code for this lock error
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyStarted(_) => "E300",
            Self::StoreUnavailable(_) => "E301",
            Self::InvalidConfig(_) => "E302",
        }
    }
}

impl From<StoreError> for LockError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// Identity of one running instance
///
/// Generated once per coordinator and written into the store as the holder or
/// requester id, so each instance can tell its own records from others'.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Whether a stored id string refers to this instance
    pub fn matches(&self, stored: &str) -> bool {
        Uuid::parse_str(stored.trim()).is_ok_and(|id| id == self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timing configuration for a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Holder heartbeat period
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which the holder is presumed dead
    pub stale_timeout: Duration,

    /// Maximum time between a waiter's staleness checks
    pub watchdog_interval: Duration,

    /// Wait between a claim/request write and the verifying re-read
    pub claim_settle: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            stale_timeout: STALE_TIMEOUT,
            watchdog_interval: WATCHDOG_INTERVAL,
            claim_settle: CLAIM_SETTLE,
        }
    }
}

impl LockConfig {
    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the stale timeout
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    /// Set the watchdog interval
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Set the claim settle delay
    pub fn with_claim_settle(mut self, settle: Duration) -> Self {
        self.claim_settle = settle;
        self
    }

    /// Check that the timings can keep a live holder from looking stale
    pub fn validate(&self) -> LockResult<()> {
        if self.heartbeat_interval.is_zero() || self.watchdog_interval.is_zero() {
            return Err(LockError::InvalidConfig(
                "heartbeat and watchdog intervals must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.stale_timeout {
            return Err(LockError::InvalidConfig(format!(
                "heartbeat interval ({}ms) must be shorter than the stale timeout ({}ms)",
                self.heartbeat_interval.as_millis(),
                self.stale_timeout.as_millis()
            )));
        }
        if self.claim_settle >= self.stale_timeout {
            return Err(LockError::InvalidConfig(
                "claim settle delay must be shorter than the stale timeout".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn stale_timeout_ms(&self) -> i64 {
        duration_ms(self.stale_timeout)
    }
}

pub(crate) fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Who holds the lock and when they last proved they are alive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub last_heartbeat: i64,
}

impl LockRecord {
    /// Record naming `holder` with a heartbeat at `now_ms`
    pub fn new(holder: InstanceId, now_ms: i64) -> Self {
        Self {
            holder_id: holder.to_string(),
            last_heartbeat: now_ms,
        }
    }

    /// Read the record; missing or malformed fields mean "no holder"
    pub fn read(store: &dyn SharedStore) -> StoreResult<Option<Self>> {
        let holder_id = store.get(LOCK_HOLDER_ID_KEY)?;
        let last_heartbeat = store.get(LOCK_LAST_HEARTBEAT_KEY)?;
        Ok(parse_pair(holder_id, last_heartbeat).map(|(holder_id, last_heartbeat)| Self {
            holder_id,
            last_heartbeat,
        }))
    }

    /// Overwrite the stored record with this one
    ///
    /// The heartbeat is written first: a reader catching the gap sees a fresh
    /// heartbeat under the old holder rather than a stale one under the new.
    pub fn write(&self, store: &dyn SharedStore) -> StoreResult<()> {
        store.set(LOCK_LAST_HEARTBEAT_KEY, &self.last_heartbeat.to_string())?;
        store.set(LOCK_HOLDER_ID_KEY, &self.holder_id)
    }

    /// Remove the stored record
    ///
    /// The heartbeat goes first so that an observer of the holder-id change
    /// never sees a fresh heartbeat without a holder.
    pub fn clear(store: &dyn SharedStore) -> StoreResult<()> {
        store.delete(LOCK_LAST_HEARTBEAT_KEY)?;
        store.delete(LOCK_HOLDER_ID_KEY)
    }

    /// Milliseconds since the last heartbeat
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_heartbeat)
    }

    /// When the record goes stale
    pub fn expires_at(&self, stale_timeout_ms: i64) -> i64 {
        self.last_heartbeat.saturating_add(stale_timeout_ms)
    }

    /// Whether the holder is presumed dead
    pub fn is_stale(&self, now_ms: i64, stale_timeout_ms: i64) -> bool {
        self.age_ms(now_ms) >= stale_timeout_ms
    }
}

/// An outstanding request for the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub requester_id: String,
    pub requested_at: i64,
}

impl RequestRecord {
    /// Request by `requester` at `now_ms`
    pub fn new(requester: InstanceId, now_ms: i64) -> Self {
        Self {
            requester_id: requester.to_string(),
            requested_at: now_ms,
        }
    }

    /// Read the request slot; missing or malformed fields mean "empty"
    pub fn read(store: &dyn SharedStore) -> StoreResult<Option<Self>> {
        let requester_id = store.get(LOCK_REQUEST_ID_KEY)?;
        let requested_at = store.get(LOCK_REQUEST_AT_KEY)?;
        Ok(parse_pair(requester_id, requested_at).map(|(requester_id, requested_at)| Self {
            requester_id,
            requested_at,
        }))
    }

    /// Overwrite the request slot
    pub fn write(&self, store: &dyn SharedStore) -> StoreResult<()> {
        store.set(LOCK_REQUEST_AT_KEY, &self.requested_at.to_string())?;
        store.set(LOCK_REQUEST_ID_KEY, &self.requester_id)
    }

    /// Empty the request slot
    pub fn clear(store: &dyn SharedStore) -> StoreResult<()> {
        store.delete(LOCK_REQUEST_ID_KEY)?;
        store.delete(LOCK_REQUEST_AT_KEY)
    }

    /// A request nobody has refreshed within the stale timeout is abandoned
    pub fn is_stale(&self, now_ms: i64, stale_timeout_ms: i64) -> bool {
        now_ms.saturating_sub(self.requested_at) >= stale_timeout_ms
    }
}

fn parse_pair(id: Option<String>, timestamp: Option<String>) -> Option<(String, i64)> {
    let id = id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
    let timestamp = timestamp?.trim().parse::<i64>().ok()?;
    Some((id, timestamp))
}

/// Lock status as seen by one observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Nobody holds the lock
    Available,
    /// Held by the observing instance
    HeldBySelf,
    /// Held by another live instance
    HeldByOther,
    /// A holder is recorded but its heartbeat is stale
    Stale,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::HeldBySelf => write!(f, "held_by_self"),
            Self::HeldByOther => write!(f, "held_by_other"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Where a coordinator is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Idle,
    Claiming,
    Waiting,
    Holding,
    Releasing,
    Released,
    BackedOff,
}

impl LockState {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::BackedOff)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Waiting => "waiting",
            Self::Holding => "holding",
            Self::Releasing => "releasing",
            Self::Released => "released",
            Self::BackedOff => "backed_off",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the lock keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub status: LockStatus,
    pub holder: Option<LockRecord>,
    pub heartbeat_age_ms: Option<i64>,
    pub request: Option<RequestRecord>,
}

/// Read the lock keys and classify them relative to `observer`
pub fn read_snapshot(
    store: &dyn SharedStore,
    now_ms: i64,
    stale_timeout_ms: i64,
    observer: Option<InstanceId>,
) -> StoreResult<LockSnapshot> {
    let holder = LockRecord::read(store)?;
    let request = RequestRecord::read(store)?.filter(|r| !r.is_stale(now_ms, stale_timeout_ms));

    let status = match &holder {
        None => LockStatus::Available,
        Some(record) if record.is_stale(now_ms, stale_timeout_ms) => LockStatus::Stale,
        Some(record) if observer.is_some_and(|id| id.matches(&record.holder_id)) => {
            LockStatus::HeldBySelf
        }
        Some(_) => LockStatus::HeldByOther,
    };

    Ok(LockSnapshot {
        status,
        heartbeat_age_ms: holder.as_ref().map(|r| r.age_ms(now_ms)),
        holder,
        request,
    })
}

/// Remove every lock and request key
pub fn force_clear(store: &dyn SharedStore) -> StoreResult<()> {
    LockRecord::clear(store)?;
    RequestRecord::clear(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_instance_id_matches_only_itself() {
        let a = InstanceId::generate();
        let b = InstanceId::generate();

        assert!(a.matches(&a.to_string()));
        assert!(!a.matches(&b.to_string()));
        assert!(!a.matches("not-a-uuid"));
    }

    #[test]
    fn test_lock_record_write_read_clear() {
        let store = MemoryStore::new();
        let id = InstanceId::generate();

        assert_eq!(LockRecord::read(&store).unwrap(), None);

        let record = LockRecord::new(id, 1_000);
        record.write(&store).unwrap();
        assert_eq!(LockRecord::read(&store).unwrap(), Some(record));

        LockRecord::clear(&store).unwrap();
        assert_eq!(LockRecord::read(&store).unwrap(), None);
    }

    #[test]
    fn test_malformed_lock_record_means_no_holder() {
        let store = MemoryStore::new();

        store.set(LOCK_HOLDER_ID_KEY, "someone").unwrap();
        assert_eq!(LockRecord::read(&store).unwrap(), None);

        store.set(LOCK_LAST_HEARTBEAT_KEY, "yesterday").unwrap();
        assert_eq!(LockRecord::read(&store).unwrap(), None);

        store.set(LOCK_HOLDER_ID_KEY, "   ").unwrap();
        store.set(LOCK_LAST_HEARTBEAT_KEY, "42").unwrap();
        assert_eq!(LockRecord::read(&store).unwrap(), None);
    }

    #[test]
    fn test_staleness_is_inclusive_at_timeout() {
        let record = LockRecord {
            holder_id: "x".to_string(),
            last_heartbeat: 5_000,
        };

        assert!(!record.is_stale(34_999, 30_000));
        assert!(record.is_stale(35_000, 30_000));
        assert_eq!(record.expires_at(30_000), 35_000);
        assert_eq!(record.age_ms(6_500), 1_500);
    }

    #[test]
    fn test_request_record_roundtrip() {
        let store = MemoryStore::new();
        let id = InstanceId::generate();

        let request = RequestRecord::new(id, 7);
        request.write(&store).unwrap();
        assert_eq!(RequestRecord::read(&store).unwrap(), Some(request.clone()));
        assert!(request.is_stale(30_007, 30_000));

        RequestRecord::clear(&store).unwrap();
        assert_eq!(RequestRecord::read(&store).unwrap(), None);
    }

    #[test]
    fn test_snapshot_status() {
        let store = MemoryStore::new();
        let me = InstanceId::generate();
        let other = InstanceId::generate();

        let snap = read_snapshot(&store, 0, 30_000, Some(me)).unwrap();
        assert_eq!(snap.status, LockStatus::Available);
        assert!(snap.heartbeat_age_ms.is_none());

        LockRecord::new(me, 1_000).write(&store).unwrap();
        let snap = read_snapshot(&store, 2_000, 30_000, Some(me)).unwrap();
        assert_eq!(snap.status, LockStatus::HeldBySelf);
        assert_eq!(snap.heartbeat_age_ms, Some(1_000));

        let snap = read_snapshot(&store, 2_000, 30_000, Some(other)).unwrap();
        assert_eq!(snap.status, LockStatus::HeldByOther);

        let snap = read_snapshot(&store, 31_000, 30_000, None).unwrap();
        assert_eq!(snap.status, LockStatus::Stale);
    }

    #[test]
    fn test_force_clear_removes_everything() {
        let store = MemoryStore::new();
        LockRecord::new(InstanceId::generate(), 1).write(&store).unwrap();
        RequestRecord::new(InstanceId::generate(), 1)
            .write(&store)
            .unwrap();

        force_clear(&store).unwrap();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_lock_config_validation() {
        assert!(LockConfig::default().validate().is_ok());

        let bad = LockConfig::default().with_heartbeat_interval(Duration::from_secs(30));
        assert!(matches!(bad.validate(), Err(LockError::InvalidConfig(_))));

        let zero = LockConfig::default().with_watchdog_interval(Duration::ZERO);
        assert_eq!(zero.validate().unwrap_err().code(), "E302");
    }

    #[test]
    fn test_lock_state_terminal() {
        assert!(LockState::Released.is_terminal());
        assert!(LockState::BackedOff.is_terminal());
        assert!(!LockState::Waiting.is_terminal());
        assert_eq!(LockState::BackedOff.to_string(), "backed_off");
        assert_eq!(LockStatus::HeldByOther.to_string(), "held_by_other");
    }
}
