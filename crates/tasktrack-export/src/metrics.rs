//! Prometheus metrics for the export subsystem.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the export subsystem.
pub mod names {
    /// Total export jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "tasktrack_export_jobs_enqueued_total";
    /// Total export jobs claimed by the dispatcher.
    pub const JOBS_DISPATCHED_TOTAL: &str = "tasktrack_export_jobs_dispatched_total";
    /// Total export jobs completed.
    pub const JOBS_COMPLETED_TOTAL: &str = "tasktrack_export_jobs_completed_total";
    /// Total export jobs failed.
    pub const JOBS_FAILED_TOTAL: &str = "tasktrack_export_jobs_failed_total";
    /// Total export runs suspended by pause or cancel.
    pub const JOBS_SUSPENDED_TOTAL: &str = "tasktrack_export_jobs_suspended_total";
    /// Total processing jobs returned to pending.
    pub const JOBS_RECOVERED_TOTAL: &str = "tasktrack_export_jobs_recovered_total";
    /// Total job records removed by retention cleanup.
    pub const JOBS_CLEANED_TOTAL: &str = "tasktrack_export_jobs_cleaned_total";
    /// Total store errors seen by the dispatcher.
    pub const DISPATCH_ERRORS_TOTAL: &str = "tasktrack_export_dispatch_errors_total";

    /// Current pending jobs.
    pub const JOBS_PENDING: &str = "tasktrack_export_jobs_pending";
    /// Current running jobs.
    pub const JOBS_ACTIVE: &str = "tasktrack_export_jobs_active";

    /// Export run duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "tasktrack_export_job_duration_seconds";
    /// Time from enqueue to dispatch in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "tasktrack_export_job_wait_time_seconds";

    /// Cache lookups by outcome.
    pub const CACHE_LOOKUPS_TOTAL: &str = "tasktrack_export_cache_lookups_total";
    /// Cache entries removed by invalidation or expiry.
    pub const CACHE_EVICTIONS_TOTAL: &str = "tasktrack_export_cache_evictions_total";
    /// Swallowed cache tier errors.
    pub const CACHE_ERRORS_TOTAL: &str = "tasktrack_export_cache_errors_total";

    /// Connected gateway clients.
    pub const GATEWAY_CONNECTIONS: &str = "tasktrack_export_gateway_connections";
    /// Events delivered to gateway clients.
    pub const GATEWAY_EVENTS_TOTAL: &str = "tasktrack_export_gateway_events_total";
    /// Stalled jobs requeued on reconnect.
    pub const GATEWAY_STALLS_TOTAL: &str = "tasktrack_export_gateway_stalls_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of export jobs enqueued");
    describe_counter!(
        names::JOBS_DISPATCHED_TOTAL,
        "Total number of export jobs claimed for processing"
    );
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of export jobs completed");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of export jobs that failed");
    describe_counter!(
        names::JOBS_SUSPENDED_TOTAL,
        "Total number of export runs suspended by pause or cancel"
    );
    describe_counter!(
        names::JOBS_RECOVERED_TOTAL,
        "Total number of processing jobs returned to pending"
    );
    describe_counter!(
        names::JOBS_CLEANED_TOTAL,
        "Total number of terminal job records removed by retention cleanup"
    );
    describe_counter!(
        names::DISPATCH_ERRORS_TOTAL,
        "Total number of store errors seen by the dispatcher"
    );

    describe_gauge!(names::JOBS_PENDING, "Current number of pending export jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of running export jobs");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Export run duration in seconds");
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Time from enqueue to dispatch in seconds"
    );

    describe_counter!(names::CACHE_LOOKUPS_TOTAL, "Export cache lookups by outcome");
    describe_counter!(
        names::CACHE_EVICTIONS_TOTAL,
        "Export cache entries removed by invalidation or expiry"
    );
    describe_counter!(names::CACHE_ERRORS_TOTAL, "Swallowed export cache tier errors");

    describe_gauge!(names::GATEWAY_CONNECTIONS, "Connected export gateway clients");
    describe_counter!(names::GATEWAY_EVENTS_TOTAL, "Events delivered to gateway clients");
    describe_counter!(
        names::GATEWAY_STALLS_TOTAL,
        "Stalled export jobs requeued on client reconnect"
    );
}

/// Queue metrics recorder.
#[derive(Clone)]
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(format: &str, priority: i64) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "format" => format.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    /// Record a job claimed by the dispatcher.
    pub fn job_dispatched(wait_time: Duration) {
        counter!(names::JOBS_DISPATCHED_TOTAL).increment(1);
        histogram!(names::JOB_WAIT_TIME_SECONDS).record(wait_time.as_secs_f64());
    }

    /// Record a finished run.
    pub fn job_finished(outcome: &'static str, duration: Duration) {
        let total = match outcome {
            "completed" => names::JOBS_COMPLETED_TOTAL,
            "failed" => names::JOBS_FAILED_TOTAL,
            _ => names::JOBS_SUSPENDED_TOTAL,
        };
        counter!(total).increment(1);
        histogram!(names::JOB_DURATION_SECONDS, "outcome" => outcome).record(duration.as_secs_f64());
    }

    /// Record jobs returned to pending.
    pub fn jobs_recovered(reason: &'static str, count: u64) {
        counter!(names::JOBS_RECOVERED_TOTAL, "reason" => reason).increment(count);
    }

    /// Record jobs removed by retention cleanup.
    pub fn jobs_cleaned(count: u64) {
        counter!(names::JOBS_CLEANED_TOTAL).increment(count);
    }

    /// Record a dispatcher store error.
    pub fn dispatch_error() {
        counter!(names::DISPATCH_ERRORS_TOTAL).increment(1);
    }

    /// Update queue size gauges.
    pub fn update_queue_sizes(pending: u64, active: u64) {
        gauge!(names::JOBS_PENDING).set(pending as f64);
        gauge!(names::JOBS_ACTIVE).set(active as f64);
    }
}

/// Cache metrics recorder.
#[derive(Clone)]
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a lookup. `tier` is `ephemeral`, `durable` or `miss`.
    pub fn lookup(tier: &'static str) {
        counter!(names::CACHE_LOOKUPS_TOTAL, "tier" => tier).increment(1);
    }

    /// Record removed entries.
    pub fn evicted(reason: &'static str, count: u64) {
        counter!(names::CACHE_EVICTIONS_TOTAL, "reason" => reason).increment(count);
    }

    /// Record a swallowed tier error.
    pub fn error(operation: &'static str) {
        counter!(names::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
    }
}

/// Gateway metrics recorder.
#[derive(Clone)]
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// Update the connected client count.
    pub fn update_connections(count: usize) {
        gauge!(names::GATEWAY_CONNECTIONS).set(count as f64);
    }

    /// Record an event delivered to a client.
    pub fn event_sent(event: &'static str) {
        counter!(names::GATEWAY_EVENTS_TOTAL, "event" => event).increment(1);
    }

    /// Record a stalled job requeued on reconnect.
    pub fn stall_detected() {
        counter!(names::GATEWAY_STALLS_TOTAL).increment(1);
    }
}
