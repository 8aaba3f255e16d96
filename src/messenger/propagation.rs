//! Trace context propagation through the message property bag.
//!
//! Brokers expose headers inconsistently (Kafka byte headers, Event Hub
//! application properties, queue payloads), so the W3C `traceparent`,
//! `tracestate` and `baggage` entries travel inside [`Properties`] as JSON
//! strings and every backend maps the bag onto its own header concept.

use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::message::Properties;

/// Injects and extracts distributed trace context.
///
/// Constructed explicitly and handed to each messenger, so tests and
/// embedders never depend on a process-wide propagator being installed.
pub struct TracePropagator {
    inner: TextMapCompositePropagator,
}

impl TracePropagator {
    /// W3C trace context plus W3C baggage.
    pub fn new() -> Self {
        Self {
            inner: TextMapCompositePropagator::new(vec![
                Box::new(TraceContextPropagator::new()),
                Box::new(BaggagePropagator::new()),
            ]),
        }
    }

    /// Inject `cx` into `properties`. Existing entries with the same names
    /// are overwritten.
    pub fn prepare(&self, cx: &Context, properties: &mut Properties) {
        self.inner
            .inject_context(cx, &mut PropertiesInjector(properties));
    }

    /// Inject the context of the current `tracing` span.
    pub fn prepare_current(&self, properties: &mut Properties) {
        let cx = tracing::Span::current().context();
        self.prepare(&cx, properties);
    }

    /// Extract a propagation context from `properties`.
    ///
    /// Missing, non-string or malformed entries yield an empty context. The
    /// returned context carries the remote baggage; attach it while handling
    /// the message to make that baggage ambient.
    pub fn resume(&self, properties: &Properties) -> Context {
        self.inner.extract(&PropertiesExtractor(properties))
    }

    /// Header names this propagator writes.
    pub fn fields(&self) -> Vec<String> {
        self.inner.fields().map(str::to_string).collect()
    }
}

impl Default for TracePropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TracePropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracePropagator")
            .field("fields", &self.fields())
            .finish()
    }
}

struct PropertiesInjector<'a>(&'a mut Properties);

impl Injector for PropertiesInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0
            .insert(key.to_string(), serde_json::Value::String(value));
    }
}

struct PropertiesExtractor<'a>(&'a Properties);

impl Extractor for PropertiesExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::baggage::BaggageExt;
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry::KeyValue;

    fn remote_context() -> Context {
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        Context::new().with_remote_span_context(span_context)
    }

    #[test]
    fn test_prepare_then_resume_recovers_trace_id() {
        let propagator = TracePropagator::new();
        let cx = remote_context();
        let mut properties = Properties::new();

        propagator.prepare(&cx, &mut properties);
        let resumed = propagator.resume(&properties);

        assert_eq!(
            resumed.span().span_context().trace_id(),
            cx.span().span_context().trace_id()
        );
        assert!(resumed.span().span_context().is_remote());
    }

    #[test]
    fn test_prepare_writes_string_entries() {
        let propagator = TracePropagator::new();
        let mut properties = Properties::new();

        propagator.prepare(&remote_context(), &mut properties);

        let traceparent = properties.get("traceparent").and_then(|v| v.as_str());
        assert_eq!(
            traceparent,
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );
    }

    #[test]
    fn test_baggage_round_trip() {
        let propagator = TracePropagator::new();
        let cx = remote_context().with_baggage(vec![KeyValue::new("tenant", "acme")]);
        let mut properties = Properties::new();

        propagator.prepare(&cx, &mut properties);
        let resumed = propagator.resume(&properties);

        assert_eq!(
            resumed.baggage().get("tenant").map(|v| v.to_string()),
            Some("acme".to_string())
        );
    }

    #[test]
    fn test_resume_tolerates_missing_entries() {
        let propagator = TracePropagator::new();
        let resumed = propagator.resume(&Properties::new());

        assert!(!resumed.span().span_context().is_valid());
    }

    #[test]
    fn test_resume_tolerates_malformed_entries() {
        let propagator = TracePropagator::new();
        let mut properties = Properties::new();
        properties.insert("traceparent".to_string(), serde_json::json!(42));
        properties.insert("tracestate".to_string(), serde_json::json!("not=valid=state"));
        properties.insert("baggage".to_string(), serde_json::json!({"nested": true}));

        let resumed = propagator.resume(&properties);

        assert!(!resumed.span().span_context().is_valid());
    }

    #[test]
    fn test_resume_ignores_garbage_traceparent() {
        let propagator = TracePropagator::new();
        let mut properties = Properties::new();
        properties.insert("traceparent".to_string(), serde_json::json!("garbage"));

        let resumed = propagator.resume(&properties);

        assert!(!resumed.span().span_context().is_valid());
    }
}
