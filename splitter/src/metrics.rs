//! Application metrics recorded through the `metrics` facade.
//!
//! Values are only exported when `enable_metrics` installs the Prometheus recorder; otherwise
//! the macros are no-ops.

use std::time::Duration;

pub const SEPARATIONS_TOTAL: &str = "splitter_separations_total";
pub const SEPARATION_DURATION_SECONDS: &str = "splitter_separation_duration_seconds";
pub const STEMS_UPLOADED_TOTAL: &str = "splitter_stems_uploaded_total";
pub const DOWNLOAD_FAILURES_TOTAL: &str = "splitter_download_failures_total";

pub fn record_separation(engine: &'static str, success: bool, elapsed: Duration) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!(SEPARATIONS_TOTAL, "engine" => engine, "outcome" => outcome).increment(1);
    metrics::histogram!(SEPARATION_DURATION_SECONDS, "engine" => engine).record(elapsed.as_secs_f64());
}

pub fn record_stem_uploaded(stem: &str) {
    metrics::counter!(STEMS_UPLOADED_TOTAL, "stem" => stem.to_string()).increment(1);
}

pub fn record_download_failure() {
    metrics::counter!(DOWNLOAD_FAILURES_TOTAL).increment(1);
}
