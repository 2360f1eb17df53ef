//! Storage metrics collection.

use encnode_models::TargetNode;
use metrics::{counter, gauge, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Pin attempts by node tier and outcome.
    pub const PIN_ATTEMPTS_TOTAL: &str = "storage_pin_attempts_total";

    /// Escalations from one tier to the next.
    pub const FALLBACK_ESCALATIONS_TOTAL: &str = "storage_fallback_escalations_total";

    /// Final persistence outcome (healthy, degraded, failed).
    pub const PERSISTENCE_OUTCOMES_TOTAL: &str = "storage_persistence_outcomes_total";

    /// Upload duration in seconds.
    pub const UPLOAD_DURATION_SECONDS: &str = "storage_upload_duration_seconds";

    /// Records waiting in the lazy pin queue.
    pub const LAZY_QUEUE_DEPTH: &str = "storage_lazy_queue_depth";

    /// Entries appended to the local-fallback ledger.
    pub const LEDGER_APPENDS_TOTAL: &str = "storage_ledger_appends_total";
}

pub fn record_pin_attempt(node: TargetNode, verified: bool) {
    counter!(
        names::PIN_ATTEMPTS_TOTAL,
        "node" => node.as_str(),
        "outcome" => if verified { "verified" } else { "unverified" }
    )
    .increment(1);
}

pub fn record_escalation(from: TargetNode, to: TargetNode) {
    counter!(
        names::FALLBACK_ESCALATIONS_TOTAL,
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub fn record_outcome(outcome: &'static str) {
    counter!(names::PERSISTENCE_OUTCOMES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_upload(duration_secs: f64) {
    histogram!(names::UPLOAD_DURATION_SECONDS).record(duration_secs);
}

pub fn set_lazy_queue_depth(depth: usize) {
    gauge!(names::LAZY_QUEUE_DEPTH).set(depth as f64);
}

pub fn record_ledger_append() {
    counter!(names::LEDGER_APPENDS_TOTAL).increment(1);
}
