//! Metric names and recording helpers.
//!
//! Everything goes through the `metrics` facade; the Prometheus recorder is
//! installed by `serve`. Without a recorder these calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const RESOLVE_ATTEMPTS: &str = "gridpoint_resolve_attempts_total";
pub const REFRESH_CELLS: &str = "gridpoint_refresh_cells_total";
pub const REFRESH_RUNS: &str = "gridpoint_refresh_runs_total";
pub const REFRESH_DURATION: &str = "gridpoint_refresh_duration_seconds";
pub const CONCURRENCY: &str = "gridpoint_throttle_concurrency";
pub const LOOKUPS: &str = "gridpoint_lookup_total";
pub const INDEX_CELLS: &str = "gridpoint_index_cells";

/// Register descriptions with the installed recorder.
pub fn describe() {
    describe_counter!(RESOLVE_ATTEMPTS, "Remote points calls by outcome");
    describe_counter!(REFRESH_CELLS, "Cells processed by refresh runs, by outcome");
    describe_counter!(REFRESH_RUNS, "Finished refresh runs by status");
    describe_histogram!(REFRESH_DURATION, "Wall time of refresh runs");
    describe_gauge!(CONCURRENCY, "Current permitted concurrency per throttle");
    describe_counter!(LOOKUPS, "Lookups by outcome");
    describe_gauge!(INDEX_CELLS, "Cells in the live spatial index");
}

pub fn record_resolve_attempt(outcome: &'static str) {
    counter!(RESOLVE_ATTEMPTS, "outcome" => outcome).increment(1);
}

pub fn record_cell(outcome: &'static str) {
    counter!(REFRESH_CELLS, "outcome" => outcome).increment(1);
}

pub fn record_run(status: &'static str, seconds: f64) {
    counter!(REFRESH_RUNS, "status" => status).increment(1);
    histogram!(REFRESH_DURATION).record(seconds);
}

pub fn set_concurrency(throttle: &'static str, limit: usize) {
    gauge!(CONCURRENCY, "throttle" => throttle).set(limit as f64);
}

pub fn record_lookup(outcome: &'static str) {
    counter!(LOOKUPS, "outcome" => outcome).increment(1);
}

pub fn set_index_cells(cells: usize) {
    gauge!(INDEX_CELLS).set(cells as f64);
}
