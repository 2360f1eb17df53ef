//! Authoritative job store.
//!
//! This crate provides:
//! - The `JobStore` seam used by every acquisition path
//! - Atomic conditional claims (first successful write wins)
//! - Guarded result writes that refuse to overwrite a completed job
//! - A Redis implementation (Lua scripts) and an in-memory implementation

pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{JobStoreError, JobStoreResult};
pub use memory::MemoryJobStore;
pub use redis_store::{RedisJobStore, RedisStoreConfig};
pub use store::{Claim, JobRecord, JobStore, ReleaseOutcome};
