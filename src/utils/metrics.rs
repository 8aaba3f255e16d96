//! OTel-native metrics instruments.
//!
//! Instruments are created lazily on the global meter. Without an installed
//! meter provider they are no-ops, so recording is always safe.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("messenger"));

// ============================================================================
// Publish
// ============================================================================

/// Duration of publish operations.
pub static PUBLISH_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("messenger.publish.duration")
        .with_description("Publish duration")
        .with_unit("s")
        .build()
});

/// Total publish operations.
pub static PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("messenger.publish.total")
        .with_description("Total publish operations")
        .build()
});

// ============================================================================
// Consume
// ============================================================================

/// Total messages handled by receive loops, by outcome (ok, error, poison).
pub static CONSUME_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("messenger.consume.total")
        .with_description("Total messages consumed")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create a backend label.
pub fn backend_attr(backend: &str) -> KeyValue {
    KeyValue::new("backend", backend.to_string())
}

/// Create a topic label.
pub fn topic_attr(topic: &str) -> KeyValue {
    KeyValue::new("topic", topic.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}
