//! # gateway-store
//!
//! Session persistence for the gateway. A [`PersistenceManager`] wraps
//! a pluggable [`SessionBackend`] with a bounded retry policy,
//! per-session write serialization, and a degrade-to-memory fallback,
//! so a struggling durable store never loses the in-memory
//! conversation or blocks a chat response.
//!
//! Delivery is at-least-once: a retried append may double-write if the
//! backend acknowledged the first attempt but the ack was lost. That
//! property is accepted and documented rather than hidden.

pub mod backend;
pub mod error;
pub mod file;
pub mod manager;
pub mod memory;

pub use backend::SessionBackend;
pub use error::{Result, StoreError};
pub use file::FileBackend;
pub use manager::{PersistenceManager, SessionSummary};
pub use memory::MemoryBackend;
