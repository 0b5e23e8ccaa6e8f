//! Metric instrument factories for observatory.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"observatory"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for observatory instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("observatory")
}

/// Counter: emit calls by outcome.
/// Labels: `source`, `outcome` ("recorded" | "dropped" | "rejected").
pub fn events_emitted() -> Counter<u64> {
    meter()
        .u64_counter("observatory.events.emitted")
        .with_description("Number of emit calls by outcome")
        .build()
}

/// Histogram: time spent persisting one record, in milliseconds.
/// Labels: `outcome`.
pub fn emit_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("observatory.events.emit_duration_ms")
        .with_description("Event persistence latency in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: envelopes handed to subscriber sinks.
/// Labels: `kind`.
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("observatory.hub.deliveries")
        .with_description("Envelopes delivered to subscribers")
        .build()
}

/// Counter: envelopes a subscriber sink refused (full or closed).
/// Labels: `reason` ("full" | "closed").
pub fn deliveries_dropped() -> Counter<u64> {
    meter()
        .u64_counter("observatory.hub.deliveries_dropped")
        .with_description("Envelopes refused by subscriber sinks")
        .build()
}

/// UpDownCounter: live subscriptions.
/// Labels: `scope` ("execution" | "all").
pub fn subscriptions() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("observatory.hub.subscriptions")
        .with_description("Live hub subscriptions")
        .build()
}

/// Counter: applied lifecycle transitions.
/// Labels: `entity` ("execution" | "wave"), `to`.
pub fn lifecycle_transitions() -> Counter<u64> {
    meter()
        .u64_counter("observatory.lifecycle.transitions")
        .with_description("Applied execution and wave transitions")
        .build()
}

/// Counter: rejected lifecycle operations.
/// Labels: `operation`.
pub fn lifecycle_anomalies() -> Counter<u64> {
    meter()
        .u64_counter("observatory.lifecycle.anomalies")
        .with_description("Lifecycle operations rejected as anomalies")
        .build()
}

/// Counter: aggregate upserts that failed and were skipped.
/// Labels: `entity`.
pub fn aggregate_write_failures() -> Counter<u64> {
    meter()
        .u64_counter("observatory.lifecycle.write_failures")
        .with_description("Execution and wave upserts that failed")
        .build()
}
