//! Job store metrics.

use metrics::{counter, histogram};

/// Metric name constants.
pub mod names {
    /// Firestore requests by operation and HTTP status.
    pub const REQUESTS_TOTAL: &str = "vscale_firestore_requests_total";

    /// Retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "vscale_firestore_retries_total";

    /// Request latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "vscale_firestore_latency_seconds";

    /// Conditional writes that lost a race, by operation.
    pub const CAS_CONFLICTS_TOTAL: &str = "vscale_job_store_cas_conflicts_total";
}

/// Record metrics for a completed Firestore request.
pub fn record_request(operation: &str, status: u16, latency_ms: f64) {
    counter!(
        names::REQUESTS_TOTAL,
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(names::LATENCY_SECONDS, "operation" => operation.to_string())
        .record(latency_ms / 1000.0);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record a compare-and-set write that found the record already changed.
pub fn record_cas_conflict(operation: &'static str) {
    counter!(names::CAS_CONFLICTS_TOTAL, "operation" => operation).increment(1);
}
