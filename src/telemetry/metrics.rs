//! Metric instrument factories for autorun.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op and recording
//! costs nothing.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for autorun instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("autorun")
}

/// Counter: events accepted by the bus.
/// Labels: `event_type`.
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("autorun.bus.events_published")
        .with_description("Number of events accepted by the event bus")
        .build()
}

/// Counter: handler invocations that returned an error or panicked.
/// Labels: `event_type`, `mode` ("sync" | "async").
pub fn handler_failures() -> Counter<u64> {
    meter()
        .u64_counter("autorun.bus.handler_failures")
        .with_description("Number of failed event handler invocations")
        .build()
}

/// Counter: managed tasks reaching a terminal state.
/// Labels: `state`.
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("autorun.tasks.finished")
        .with_description("Number of managed tasks that finished")
        .build()
}

/// Counter: schedule executions launched.
/// Labels: `trigger`.
pub fn executions_started() -> Counter<u64> {
    meter()
        .u64_counter("autorun.executions.started")
        .with_description("Number of schedule executions started")
        .build()
}

/// Counter: schedule executions finalized.
/// Labels: `status` ("completed" | "failed" | "cancelled").
pub fn executions_finished() -> Counter<u64> {
    meter()
        .u64_counter("autorun.executions.finished")
        .with_description("Number of schedule executions finalized")
        .build()
}

/// Histogram: execution wall time in milliseconds.
/// Labels: `status`.
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("autorun.execution.duration_ms")
        .with_description("Schedule execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
