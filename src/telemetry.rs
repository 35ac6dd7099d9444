//! Counter shims. Compiled to no-ops unless the `metrics` feature is on.

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_queue(name: &'static str, queue: &str) {
    metrics::increment_counter!(name, "queue" => queue.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_queue(_name: &'static str, _queue: &str) {}
