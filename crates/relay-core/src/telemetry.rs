//! Distributed tracing handle.
//!
//! [`Telemetry`] bundles an OpenTelemetry tracer with the propagator used
//! to move span context through a message's trace carrier. Both the
//! consume-side middleware and the publisher hold one.

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// Instrumentation scope name used for the global tracer.
pub const INSTRUMENTATION_NAME: &str = "relay";

/// Span name for consuming from `exchange` with `routing_key`.
#[must_use]
pub fn consume_span_name(exchange: &str, routing_key: &str) -> String {
    format!("|consume|{}|{}", exchange, routing_key)
}

/// Span name for publishing to `exchange` with `routing_key`.
#[must_use]
pub fn publish_span_name(exchange: &str, routing_key: &str) -> String {
    format!("|publish|{}|{}", exchange, routing_key)
}

/// A tracer plus the propagator for its span context.
pub struct Telemetry<T = BoxedTracer> {
    tracer: T,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl Telemetry<BoxedTracer> {
    /// Use the globally installed tracer provider.
    #[must_use]
    pub fn global() -> Self {
        Self::new(global::tracer(INSTRUMENTATION_NAME))
    }
}

impl Default for Telemetry<BoxedTracer> {
    fn default() -> Self {
        Self::global()
    }
}

impl<T> Telemetry<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    /// Wrap `tracer`, propagating with W3C trace context.
    #[must_use]
    pub fn new(tracer: T) -> Self {
        Self {
            tracer,
            propagator: Arc::new(TraceContextPropagator::new()),
        }
    }

    /// Replace the propagator.
    #[must_use]
    pub fn with_propagator<P>(mut self, propagator: P) -> Self
    where
        P: TextMapPropagator + Send + Sync + 'static,
    {
        self.propagator = Arc::new(propagator);
        self
    }

    /// Start a span under `parent`.
    pub fn start_span(
        &self,
        name: String,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
        parent: &Context,
    ) -> T::Span {
        let builder = self
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attributes);
        self.tracer.build_with_context(builder, parent)
    }

    /// Start a span under `parent` and return `parent` with the span active.
    pub fn start_in(
        &self,
        name: String,
        kind: SpanKind,
        attributes: Vec<KeyValue>,
        parent: &Context,
    ) -> Context {
        let span = self.start_span(name, kind, attributes, parent);
        parent.with_span(span)
    }

    /// Serialize the span context of `cx` into a carrier.
    #[must_use]
    pub fn inject(&self, cx: &Context) -> HashMap<String, String> {
        let mut carrier = HashMap::new();
        self.propagator.inject_context(cx, &mut carrier);
        carrier
    }

    /// Restore a remote span context from `carrier` on top of `cx`.
    ///
    /// Returns `None` if the carrier holds no valid span context.
    #[must_use]
    pub fn extract(&self, cx: &Context, carrier: &HashMap<String, String>) -> Option<Context> {
        let remote = self.propagator.extract_with_context(&Context::new(), carrier);
        let span_context = remote.span().span_context().clone();
        span_context
            .is_valid()
            .then(|| cx.with_remote_span_context(span_context))
    }
}

/// Ends the span active in its context when dropped, including during
/// unwinding.
pub struct SpanGuard(Context);

impl SpanGuard {
    /// Guard the span active in `cx`.
    #[must_use]
    pub fn new(cx: Context) -> Self {
        Self(cx)
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.0.span().end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::TracerProvider;

    fn telemetry() -> (TracerProvider, Telemetry<opentelemetry_sdk::trace::Tracer>) {
        let provider = TracerProvider::builder().build();
        let telemetry = Telemetry::new(provider.tracer("test"));
        (provider, telemetry)
    }

    #[test]
    fn test_span_names() {
        assert_eq!(consume_span_name("ex", "key"), "|consume|ex|key");
        assert_eq!(publish_span_name("ex", "key"), "|publish|ex|key");
    }

    #[test]
    fn test_inject_extract() {
        let (_provider, telemetry) = telemetry();
        let cx = telemetry.start_in("op".into(), SpanKind::Producer, vec![], &Context::new());

        let carrier = telemetry.inject(&cx);
        assert!(carrier.contains_key("traceparent"));

        let remote = telemetry.extract(&Context::new(), &carrier).unwrap();
        let local = cx.span().span_context().clone();
        let restored = remote.span().span_context().clone();
        assert_eq!(restored.trace_id(), local.trace_id());
        assert_eq!(restored.span_id(), local.span_id());
        assert!(restored.is_remote());
    }

    #[test]
    fn test_extract_garbage() {
        let (_provider, telemetry) = telemetry();
        let mut carrier = HashMap::new();
        carrier.insert("traceparent".to_string(), "not-a-trace".to_string());

        assert!(telemetry.extract(&Context::new(), &carrier).is_none());
        assert!(telemetry.extract(&Context::new(), &HashMap::new()).is_none());
    }

    #[test]
    fn test_extract_garbage_ignores_incoming_span() {
        let (_provider, telemetry) = telemetry();
        let incoming = telemetry.start_in("in".into(), SpanKind::Internal, vec![], &Context::new());

        let mut carrier = HashMap::new();
        carrier.insert("traceparent".to_string(), "garbage".to_string());

        assert!(telemetry.extract(&incoming, &carrier).is_none());
        assert!(telemetry.extract(&incoming, &HashMap::new()).is_none());
    }

    #[test]
    fn test_extract_keeps_incoming_values() {
        #[derive(Debug, PartialEq)]
        struct Tenant(&'static str);

        let (_provider, telemetry) = telemetry();
        let producer =
            telemetry.start_in("op".into(), SpanKind::Producer, vec![], &Context::new());
        let carrier = telemetry.inject(&producer);

        let incoming = Context::new().with_value(Tenant("acme"));
        let remote = telemetry.extract(&incoming, &carrier).unwrap();
        assert_eq!(remote.get::<Tenant>(), Some(&Tenant("acme")));
        assert_eq!(
            remote.span().span_context().span_id(),
            producer.span().span_context().span_id()
        );
    }
}
