//! Content-addressed storage for encoder outputs.
//!
//! This crate provides:
//! - A `StorageNode` seam with a Kubo HTTP API implementation
//! - The persistence verifier and single-attempt pin driver
//! - Tank mode: upload once, then pin with retry and tiered fallback
//! - The durable lazy pin queue and its local-fallback ledger
//! - Local pin tracking for content archived on the worker's own node

pub mod error;
pub mod ledger;
pub mod lazy_queue;
pub mod local_store;
pub mod metrics;
pub mod node;
pub mod pin_driver;
pub mod tank;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod verifier;

pub use error::{StorageError, StorageResult};
pub use lazy_queue::{LazyPinQueue, LazyQueueConfig};
pub use ledger::{FallbackLedger, LedgerEntry};
pub use local_store::{LocalPin, LocalPinStore, SyncStatus};
pub use node::{same_api_root, KuboNode, KuboNodeConfig, StorageNode, TieredNode, UploadReceipt};
pub use pin_driver::{PinAttempt, PinDriver};
pub use tank::{PersistHealth, PersistOutcome, TankConfig, TankEngine};
pub use verifier::PersistenceVerifier;
