//! Domain event infrastructure
//!
//! Events record what happened to an aggregate (for the lock domain, one
//! running instance) and can be fanned out to any [`EventPublisher`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use crate::error::Result;

/// Base trait for all domain events
pub trait DomainEvent: Send + Sync {
    /// Get the event type as a string
    fn event_type(&self) -> &str;

    /// Get the aggregate ID this event belongs to
    fn aggregate_id(&self) -> Uuid;

    /// Get the timestamp when this event occurred
    fn timestamp(&self) -> DateTime<Utc>;

    /// Get optional event data as JSON
    fn data(&self) -> Option<&serde_json::Value>;
}

/// Publisher trait for emitting domain events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event
    async fn publish(&self, event: &dyn DomainEvent) -> Result<()>;
}

/// A recorded event, detached from its concrete type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Snapshot a domain event
    pub fn from_event(event: &dyn DomainEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: event.aggregate_id(),
            event_type: event.event_type().to_string(),
            data: event.data().cloned(),
            created_at: event.timestamp(),
        }
    }
}

/// In-memory event log, useful as a publisher in tests and diagnostics
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// All events, oldest first
    pub fn all_events(&self) -> Vec<StoredEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events recorded for one aggregate
    pub fn events_for(&self, aggregate_id: Uuid) -> Vec<StoredEvent> {
        self.filtered(|e| e.aggregate_id == aggregate_id)
    }

    /// Events of one type
    pub fn events_by_type(&self, event_type: &str) -> Vec<StoredEvent> {
        self.filtered(|e| e.event_type == event_type)
    }

    fn filtered(&self, keep: impl Fn(&StoredEvent) -> bool) -> Vec<StoredEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventStore {
    async fn publish(&self, event: &dyn DomainEvent) -> Result<()> {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredEvent::from_event(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping {
        aggregate: Uuid,
        kind: &'static str,
    }

    impl DomainEvent for Ping {
        fn event_type(&self) -> &str {
            self.kind
        }

        fn aggregate_id(&self) -> Uuid {
            self.aggregate
        }

        fn timestamp(&self) -> DateTime<Utc> {
            Utc::now()
        }

        fn data(&self) -> Option<&serde_json::Value> {
            None
        }
    }

    #[tokio::test]
    async fn test_publish_and_filter() {
        let store = InMemoryEventStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.publish(&Ping { aggregate: a, kind: "one" }).await.unwrap();
        store.publish(&Ping { aggregate: b, kind: "two" }).await.unwrap();
        store.publish(&Ping { aggregate: a, kind: "two" }).await.unwrap();

        assert_eq!(store.all_events().len(), 3);
        assert_eq!(store.events_for(a).len(), 2);
        assert_eq!(store.events_by_type("two").len(), 2);
        assert_eq!(store.all_events()[0].event_type, "one");
    }
}
