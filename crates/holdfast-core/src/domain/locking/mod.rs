//! Single-active-instance session lock
//!
//! Lets several instances share one persistent profile while only one of
//! them is active at a time. Coordination happens purely through a shared
//! key-value store and its change notifications; there are no native mutexes
//! and no transactions.
//!
//! # Architecture
//!
//! - **Records**: `LockRecord` (holder + heartbeat), `RequestRecord` (the
//!   single waiter slot)
//! - **Coordinator**: `LockCoordinator`, the only entry point
//! - **Holder task**: heartbeat and cooperative handoff while holding
//!
//! # Example
//!
//! ```ignore
//! use holdfast_core::domain::locking::{LockConfig, LockCoordinator};
//! use holdfast_core::storage::FileStore;
//!
//! let store = Arc::new(FileStore::open_default("/tmp/profile/lock")?);
//! let lock = LockCoordinator::new(store, LockConfig::default());
//!
//! if lock.acquire(|| async { flush_pending_work().await }).await? {
//!     // This instance is the active one
//! }
//!
//! // On exit, hand off cleanly
//! lock.shutdown().await;
//! ```

pub mod coordinator;
pub mod event;
mod holder;
pub mod types;

// Re-export main types
pub use coordinator::LockCoordinator;
pub use event::{LockEvent, LockEventType};
pub use types::{
    InstanceId, LockConfig, LockError, LockRecord, LockResult, LockSnapshot, LockState,
    LockStatus, RequestRecord, force_clear, read_snapshot,
};
