//! Encoder worker.
//!
//! This crate provides:
//! - Job acquisition: gateway polling and rescue of abandoned jobs
//! - The per-job state machine with store/gateway mirroring
//! - Encode → persist → complete processing with an encode cache
//! - Completion reporting with defensive-takeover routing
//! - Periodic cleanup of local pins, cache and scratch space

pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod encode_cache;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod reporter;
pub mod retry;
pub mod state_machine;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cleanup::{CleanupReport, CleanupTask};
pub use config::{NodeEndpoints, RescueConfig, WorkerConfig};
pub use coordinator::{Coordinator, RescueReport};
pub use encode_cache::{CacheKey, EncodeCache};
pub use encoder::{CommandEncoder, EncodeRequest, EncodedOutput, Encoder};
pub use error::{FailureClass, WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use processor::{JobOutcome, JobProcessor};
pub use reporter::{CompletionReporter, CompletionRoute, FailureRoute};
pub use state_machine::{JobDriver, Precheck};
