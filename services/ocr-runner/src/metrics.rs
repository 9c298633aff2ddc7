//! Prometheus metrics exposition
//!
//! Runner metrics:
//!
//! - `ocr_items_total` (counter): label `status`
//! - `ocr_item_duration_seconds` (histogram): label `status`
//!
//! The scheduler's own `scheduler_*` series are recorded by `key_pool` and
//! rendered through the same recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Item durations span a cached hit (well under a second) to several
/// exhaustion waits plus backoffs.
const ITEM_DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Exhaustion waits are bounded by a minute reset, or by `max_wait_secs`.
const WAIT_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 90.0, 300.0];

pub(crate) fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("ocr_item_duration_seconds".to_string()),
            ITEM_DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
        .set_buckets_for_metric(
            Matcher::Full("scheduler_wait_seconds".to_string()),
            WAIT_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Explicit buckets make both duration series render as Prometheus histograms
/// (with `_bucket` lines) rather than summaries.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record one finished item with its terminal status.
pub fn record_item(status: &str, duration_secs: f64) {
    metrics::counter!("ocr_items_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("ocr_item_duration_seconds", "status" => status.to_string())
        .record(duration_secs);
}
