//! Metric instrument factories for threadle.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"threadle"` meter. Without a
//! registered provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for threadle instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("threadle")
}

/// Counter: task attempts handed to an executor.
/// Labels: `kind` ("original" | "retry").
pub fn task_submitted() -> Counter<u64> {
    meter()
        .u64_counter("threadle.task.submitted")
        .with_description("Number of task attempts handed to the executor")
        .build()
}

/// Counter: finished task attempts.
/// Labels: `result` ("ok" | "failed" | "exhausted").
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("threadle.task.outcomes")
        .with_description("Number of finished task attempts by result")
        .build()
}

/// Counter: submissions refused because the engine was shut down.
pub fn task_rejected() -> Counter<u64> {
    meter()
        .u64_counter("threadle.task.rejected")
        .with_description("Number of submissions rejected after shutdown")
        .build()
}

/// Histogram: attempt run time in milliseconds.
/// Labels: `result`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("threadle.task.duration_ms")
        .with_description("Task attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: keyed mutex acquisitions.
pub fn mutex_acquired() -> Counter<u64> {
    meter()
        .u64_counter("threadle.mutex.acquired")
        .with_description("Number of keyed mutex acquisitions")
        .build()
}
