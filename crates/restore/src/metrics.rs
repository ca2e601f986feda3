//! Restoration metrics recorded via the `metrics` crate.
//!
//! ## Metric Naming Conventions
//!
//! All metrics follow the pattern: `etcdwarden_restore_{name}_{unit}`
//!
//! - Counters: `_total` suffix
//! - Histograms: `_seconds` or `_bytes` suffix
//! - Gauges: no suffix

use metrics::{counter, gauge, histogram};

const RESTORATION_DURATION: &str = "etcdwarden_restore_duration_seconds";
const DELTAS_FETCHED_TOTAL: &str = "etcdwarden_restore_deltas_fetched_total";
const DELTA_FETCH_FAILURES_TOTAL: &str = "etcdwarden_restore_delta_fetch_failures_total";
const DELTAS_APPLIED_TOTAL: &str = "etcdwarden_restore_deltas_applied_total";
const APPLIED_REVISION: &str = "etcdwarden_restore_applied_revision";
const LEAN_CYCLES_TOTAL: &str = "etcdwarden_restore_lean_cycles_total";
const DEFRAGS_TOTAL: &str = "etcdwarden_restore_defrags_total";

/// Records the wall-clock duration of one restore invocation.
pub fn record_restoration_duration(outcome: &'static str, seconds: f64) {
    histogram!(RESTORATION_DURATION, "outcome" => outcome).record(seconds);
}

/// Records one delta snapshot fetched and persisted.
pub fn record_delta_fetched() {
    counter!(DELTAS_FETCHED_TOTAL).increment(1);
}

/// Records one failed delta fetch.
pub fn record_fetch_failure() {
    counter!(DELTA_FETCH_FAILURES_TOTAL).increment(1);
}

/// Records one delta snapshot applied, and the revision the transient etcd
/// has reached.
pub fn record_delta_applied(revision: i64) {
    counter!(DELTAS_APPLIED_TOTAL).increment(1);
    gauge!(APPLIED_REVISION).set(revision as f64);
}

/// Records the outcome of one lean-keeping cycle.
pub fn record_lean_cycle(outcome: &'static str) {
    counter!(LEAN_CYCLES_TOTAL, "outcome" => outcome).increment(1);
}

/// Records the outcome of one defragmentation call.
pub fn record_defrag(outcome: &'static str) {
    counter!(DEFRAGS_TOTAL, "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_are_callable_without_a_recorder() {
        // Without an installed recorder these are no-ops; the test pins the
        // call signatures used across the engine.
        record_restoration_duration("success", 1.5);
        record_delta_fetched();
        record_fetch_failure();
        record_delta_applied(42);
        record_lean_cycle("failure");
        record_defrag("success");
    }
}
