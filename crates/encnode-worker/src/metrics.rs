//! Worker metrics collection.

use metrics::{counter, histogram};
use tracing::info;

use encnode_models::AcquisitionPath;

use crate::error::{FailureClass, WorkerError, WorkerResult};

/// Metric name constants for consistency.
pub mod names {
    /// Jobs acquired, by acquisition path.
    pub const JOBS_ACQUIRED_TOTAL: &str = "worker_jobs_acquired_total";

    /// Conditional claims lost to another worker, by acquisition path.
    pub const CLAIMS_RACE_LOST_TOTAL: &str = "worker_claims_race_lost_total";

    /// Rescue scans run.
    pub const RESCUE_CYCLES_TOTAL: &str = "worker_rescue_cycles_total";

    /// Gateway polls that failed.
    pub const GATEWAY_POLL_ERRORS_TOTAL: &str = "worker_gateway_poll_errors_total";

    /// Completions, by route (gateway, direct).
    pub const JOBS_COMPLETED_TOTAL: &str = "worker_jobs_completed_total";

    /// Failures, by class.
    pub const JOBS_FAILED_TOTAL: &str = "worker_jobs_failed_total";

    /// End-to-end job duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "worker_job_duration_seconds";

    /// Encode cache lookups, by outcome (hit, miss).
    pub const ENCODE_CACHE_LOOKUPS_TOTAL: &str = "worker_encode_cache_lookups_total";
}

pub fn record_acquired(path: AcquisitionPath) {
    counter!(names::JOBS_ACQUIRED_TOTAL, "path" => path.as_str()).increment(1);
}

pub fn record_race_lost(path: AcquisitionPath) {
    counter!(names::CLAIMS_RACE_LOST_TOTAL, "path" => path.as_str()).increment(1);
}

pub fn record_rescue_cycle() {
    counter!(names::RESCUE_CYCLES_TOTAL).increment(1);
}

pub fn record_poll_error() {
    counter!(names::GATEWAY_POLL_ERRORS_TOTAL).increment(1);
}

pub fn record_completed(route: &'static str, duration_secs: f64) {
    counter!(names::JOBS_COMPLETED_TOTAL, "route" => route).increment(1);
    histogram!(names::JOB_DURATION_SECONDS).record(duration_secs);
}

pub fn record_failed(class: FailureClass) {
    counter!(names::JOBS_FAILED_TOTAL, "class" => class.as_str()).increment(1);
}

pub fn record_cache_lookup(hit: bool) {
    counter!(
        names::ENCODE_CACHE_LOOKUPS_TOTAL,
        "outcome" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Install the Prometheus exporter on `0.0.0.0:port`.
pub fn install_prometheus(port: u16) -> WorkerResult<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))?;
    info!(port, "Prometheus exporter listening");
    Ok(())
}
