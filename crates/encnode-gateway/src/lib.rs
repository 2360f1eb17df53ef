//! Gateway REST client.
//!
//! The gateway hands out jobs and receives progress and completion reports.
//! Its availability is not assumed: every call is time-bounded, and 5xx or
//! network failures are classified as transient so callers can fall back.

pub mod client;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod signer;
pub mod types;

pub use client::{Gateway, GatewayClient, GatewayConfig};
pub use error::{GatewayError, GatewayResult};
pub use retry::{with_retry, RetryConfig};
pub use signer::{RequestSigner, StaticTokenSigner};
