//! Domain layer
//!
//! Contains the lock protocol and its event model.

pub mod events;
pub mod locking;
