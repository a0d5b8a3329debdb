// Metrics for lock operations
// Counters, gauges, and histograms published through the `metrics` facade

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::store::Operation;

/// Register metric descriptions
/// Call once at startup, after installing a recorder
pub fn describe_metrics() {
    describe_counter!(
        "redlock_rounds_total",
        "Total number of quorum rounds, labelled by operation and outcome"
    );
    describe_histogram!(
        "redlock_round_duration_seconds",
        "Quorum round duration in seconds"
    );
    describe_counter!(
        "redlock_quorum_failures_total",
        "Operations that exhausted their retry window without quorum"
    );
    describe_counter!(
        "redlock_rollbacks_total",
        "Compensating deletes issued after a failed acquire"
    );
    describe_counter!(
        "redlock_rollback_failures_total",
        "Store instances that did not acknowledge a rollback"
    );
    describe_gauge!(
        "redlock_auto_extensions_active",
        "Number of running auto-extension tasks"
    );

    tracing::debug!("Lock metrics described");
}

/// Record one quorum round
pub fn record_round(operation: Operation, success: bool, elapsed: Duration) {
    let outcome = if success { "success" } else { "failure" };
    counter!("redlock_rounds_total", "operation" => operation.as_str(), "outcome" => outcome)
        .increment(1);
    histogram!("redlock_round_duration_seconds", "operation" => operation.as_str())
        .record(elapsed.as_secs_f64());
}

/// Record an operation that ran out of attempts
pub fn record_quorum_failure(operation: Operation) {
    counter!("redlock_quorum_failures_total", "operation" => operation.as_str()).increment(1);
}

/// Record a rollback and how many instances did not acknowledge it
pub fn record_rollback(unacknowledged: usize) {
    counter!("redlock_rollbacks_total").increment(1);
    if unacknowledged > 0 {
        counter!("redlock_rollback_failures_total").increment(unacknowledged as u64);
    }
}

/// Track running auto-extension tasks
pub fn auto_extension_started() {
    gauge!("redlock_auto_extensions_active").increment(1.0);
}

pub fn auto_extension_stopped() {
    gauge!("redlock_auto_extensions_active").decrement(1.0);
}
