//! Locking domain events
//!
//! Events for tracking session lock activity of one instance. The aggregate
//! id is the instance id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::InstanceId;
use crate::domain::events::DomainEvent;

/// Type of lock event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventType {
    /// The instance became the holder
    LockAcquired,
    /// The instance cleared its lock record
    LockReleased,
    /// The instance backed off because another requester got there first
    LockContention,
    /// A stale holder was found and is being taken over
    StaleLockDetected,
    /// The holder was asked to give the lock up
    LockSuperseded,
}

impl LockEventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockAcquired => "lock_acquired",
            Self::LockReleased => "lock_released",
            Self::LockContention => "lock_contention",
            Self::StaleLockDetected => "stale_lock_detected",
            Self::LockSuperseded => "lock_superseded",
        }
    }
}

impl std::fmt::Display for LockEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A locking domain event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: LockEventType,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl LockEvent {
    fn new(instance: InstanceId, event_type: LockEventType, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: instance.uuid(),
            event_type,
            data: Some(data),
            created_at: Utc::now(),
        }
    }

    /// The instance now holds the lock after waiting `waited_ms`
    pub fn lock_acquired(instance: InstanceId, waited_ms: u64) -> Self {
        let data = serde_json::json!({ "waited_ms": waited_ms });
        Self::new(instance, LockEventType::LockAcquired, data)
    }

    /// The instance released the lock after holding it for `held_ms`
    pub fn lock_released(instance: InstanceId, held_ms: u64) -> Self {
        let data = serde_json::json!({ "held_ms": held_ms });
        Self::new(instance, LockEventType::LockReleased, data)
    }

    /// The instance backed off in favour of `current_requester`
    pub fn lock_contention(instance: InstanceId, current_requester: Option<&str>) -> Self {
        let data = serde_json::json!({ "current_requester": current_requester });
        Self::new(instance, LockEventType::LockContention, data)
    }

    /// `stale_holder` stopped heartbeating `age_ms` ago
    pub fn stale_lock_detected(instance: InstanceId, stale_holder: &str, age_ms: i64) -> Self {
        let data = serde_json::json!({
            "stale_holder": stale_holder,
            "age_ms": age_ms,
        });
        Self::new(instance, LockEventType::StaleLockDetected, data)
    }

    /// The holder is giving the lock up for `reason`
    pub fn lock_superseded(instance: InstanceId, reason: &str) -> Self {
        let data = serde_json::json!({ "reason": reason });
        Self::new(instance, LockEventType::LockSuperseded, data)
    }
}

impl DomainEvent for LockEvent {
    fn event_type(&self) -> &str {
        self.event_type.as_str()
    }

    fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }
}
