//! Holdfast Core Library
//!
//! This crate provides the core functionality for Holdfast, including:
//! - Session lock coordination (one active instance per shared profile)
//! - Shared key-value stores with change notification (in-memory and file-based)
//! - Lock domain events
//! - OIDC authorization-code login flow
//! - Configuration management

pub mod auth;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock, TokioClock};
    pub use crate::config::Config;
    pub use crate::domain::locking::{LockConfig, LockCoordinator, LockError, LockState};
    pub use crate::error::{Error, Result};
    pub use crate::storage::{FileStore, MemoryStore, SharedStore};
}
