//! Outbound publishing with trace context.
//!
//! Every publish runs inside a `|publish|{exchange}|{routing_key}` producer
//! span whose context is written into the envelope's trace carrier header,
//! so the consume side can continue the trace.

use std::sync::Arc;

use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use relay_core::telemetry::publish_span_name;
use relay_core::{SpanGuard, Telemetry};
use relay_protocol::{ProtocolError, Publishing};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::{Client, ClientError};

/// Publish errors.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The payload or trace carrier could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] ProtocolError),

    /// The client rejected the publish.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Serialize `payload` as JSON and publish it to `exchange` with
/// `routing_key`.
///
/// Returns the generated message id. Failures are recorded on the publish
/// span and returned unchanged; nothing is retried.
pub async fn publish<C, T, P>(
    cx: &Context,
    telemetry: &Telemetry<T>,
    client: &C,
    exchange: &str,
    routing_key: &str,
    payload: &P,
) -> Result<String, PublishError>
where
    C: Client + ?Sized,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
    P: Serialize + Sync + ?Sized,
{
    let traced = start_publish_span(cx, telemetry, exchange, routing_key);
    let _guard = SpanGuard::new(traced.clone());

    let result = match Publishing::json(payload) {
        Ok(msg) => send(&traced, telemetry, client, exchange, routing_key, msg).await,
        Err(err) => Err(err.into()),
    };

    record_outcome(&traced, exchange, routing_key, result)
}

/// Publish a caller-built envelope to `exchange` with `routing_key`.
///
/// The envelope keeps its id, content type and encoding; only the trace
/// carrier header is overwritten.
pub async fn publish_message<C, T>(
    cx: &Context,
    telemetry: &Telemetry<T>,
    client: &C,
    exchange: &str,
    routing_key: &str,
    msg: Publishing,
) -> Result<String, PublishError>
where
    C: Client + ?Sized,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    let traced = start_publish_span(cx, telemetry, exchange, routing_key);
    let _guard = SpanGuard::new(traced.clone());

    let result = send(&traced, telemetry, client, exchange, routing_key, msg).await;
    record_outcome(&traced, exchange, routing_key, result)
}

fn start_publish_span<T>(
    cx: &Context,
    telemetry: &Telemetry<T>,
    exchange: &str,
    routing_key: &str,
) -> Context
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    telemetry.start_in(
        publish_span_name(exchange, routing_key),
        SpanKind::Producer,
        vec![
            KeyValue::new("messaging.destination", exchange.to_string()),
            KeyValue::new("messaging.routing_key", routing_key.to_string()),
        ],
        cx,
    )
}

async fn send<C, T>(
    traced: &Context,
    telemetry: &Telemetry<T>,
    client: &C,
    exchange: &str,
    routing_key: &str,
    mut msg: Publishing,
) -> Result<String, PublishError>
where
    C: Client + ?Sized,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    let message_id = msg.message_id.clone();
    traced
        .span()
        .set_attribute(KeyValue::new("message_id", message_id.clone()));

    msg.set_trace_carrier(&telemetry.inject(traced))?;
    client
        .publish(traced, exchange, routing_key, false, false, msg)
        .await?;

    Ok(message_id)
}

fn record_outcome(
    traced: &Context,
    exchange: &str,
    routing_key: &str,
    result: Result<String, PublishError>,
) -> Result<String, PublishError> {
    match &result {
        Ok(message_id) => {
            debug!(exchange, routing_key, message_id = %message_id, "Published message");
        }
        Err(err) => {
            warn!(exchange, routing_key, error = %err, "Publish failed");
            let span = traced.span();
            span.record_error(err);
            span.set_status(Status::error(err.to_string()));
        }
    }
    result
}

/// A publisher bound to one client and tracer.
pub struct Publisher<C: ?Sized, T = BoxedTracer> {
    client: Arc<C>,
    telemetry: Arc<Telemetry<T>>,
}

impl<C: Client + ?Sized> Publisher<C, BoxedTracer> {
    /// Publish through `client` using the global tracer.
    #[must_use]
    pub fn new(client: Arc<C>) -> Self {
        Self::with_telemetry(client, Arc::new(Telemetry::global()))
    }
}

impl<C, T> Publisher<C, T>
where
    C: Client + ?Sized,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    /// Publish through `client` using `telemetry`.
    #[must_use]
    pub fn with_telemetry(client: Arc<C>, telemetry: Arc<Telemetry<T>>) -> Self {
        Self { client, telemetry }
    }

    /// Get the underlying client.
    #[must_use]
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// See [`publish`].
    pub async fn publish<P>(
        &self,
        cx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &P,
    ) -> Result<String, PublishError>
    where
        P: Serialize + Sync + ?Sized,
    {
        publish(
            cx,
            self.telemetry.as_ref(),
            self.client.as_ref(),
            exchange,
            routing_key,
            payload,
        )
        .await
    }

    /// See [`publish_message`].
    pub async fn publish_message(
        &self,
        cx: &Context,
        exchange: &str,
        routing_key: &str,
        msg: Publishing,
    ) -> Result<String, PublishError> {
        publish_message(
            cx,
            self.telemetry.as_ref(),
            self.client.as_ref(),
            exchange,
            routing_key,
            msg,
        )
        .await
    }
}

impl<C: ?Sized, T> Clone for Publisher<C, T> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            telemetry: Arc::clone(&self.telemetry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ConsumerSpec;
    use crate::memory::{MemoryBroker, Outcome};
    use opentelemetry::trace::{SpanId, TracerProvider as _};
    use opentelemetry_sdk::export::trace::SpanData;
    use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
    use opentelemetry_sdk::trace::TracerProvider;
    use relay_core::middleware::trace_propagation;
    use relay_core::{BoxError, Delivery, DispatchError, Router};
    use relay_protocol::{JSON_CONTENT_TYPE, TRACE_CARRIER_HEADER, UTF8_CONTENT_ENCODING};
    use std::time::Duration;

    type SdkTelemetry = Telemetry<opentelemetry_sdk::trace::Tracer>;

    struct Harness {
        exporter: InMemorySpanExporter,
        _provider: TracerProvider,
        telemetry: Arc<SdkTelemetry>,
    }

    impl Harness {
        fn new() -> Self {
            let exporter = InMemorySpanExporter::default();
            let provider = TracerProvider::builder()
                .with_simple_exporter(exporter.clone())
                .build();
            let telemetry = Arc::new(Telemetry::new(provider.tracer("test")));
            Self {
                exporter,
                _provider: provider,
                telemetry,
            }
        }

        fn span(&self, name: &str) -> SpanData {
            self.exporter
                .get_finished_spans()
                .unwrap()
                .into_iter()
                .find(|s| s.name == name)
                .unwrap()
        }

        /// Wait for a span ended on another task.
        async fn finished(&self, name: &str) -> SpanData {
            for _ in 0..500 {
                let spans = self.exporter.get_finished_spans().unwrap();
                if let Some(span) = spans.into_iter().find(|s| s.name == name) {
                    return span;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("span {} never finished", name);
        }
    }

    #[tokio::test]
    async fn test_publish_builds_json_envelope_with_carrier() {
        let harness = Harness::new();
        let broker = MemoryBroker::new();
        let publisher =
            Publisher::with_telemetry(Arc::new(broker.clone()), harness.telemetry.clone());

        let payload = serde_json::json!({"n": 1});
        let id = publisher
            .publish(&Context::new(), "exchange_1", "event_1", &payload)
            .await
            .unwrap();

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        let (exchange, routing_key, msg) = &published[0];
        assert_eq!(exchange, "exchange_1");
        assert_eq!(routing_key, "event_1");
        assert_eq!(msg.message_id, id);
        assert_eq!(msg.content_type, JSON_CONTENT_TYPE);
        assert_eq!(msg.content_encoding, UTF8_CONTENT_ENCODING);
        assert_eq!(&msg.body[..], br#"{"n":1}"#);
        assert!(msg.headers.contains_key(TRACE_CARRIER_HEADER));

        let span = harness.span("|publish|exchange_1|event_1");
        assert_eq!(span.span_kind, SpanKind::Producer);
        let carrier = msg.trace_carrier().unwrap();
        assert!(carrier["traceparent"].contains(&span.span_context.span_id().to_string()));
    }

    #[tokio::test]
    async fn test_publish_message_keeps_envelope() {
        let harness = Harness::new();
        let broker = MemoryBroker::new();

        let msg = Publishing::new("fixed-id", "raw bytes").with_header("tenant", "acme");
        let id = publish_message(
            &Context::new(),
            harness.telemetry.as_ref(),
            &broker,
            "exchange_1",
            "event_1",
            msg,
        )
        .await
        .unwrap();
        assert_eq!(id, "fixed-id");

        let published = broker.published().await;
        let msg = &published[0].2;
        assert_eq!(msg.headers["tenant"], "acme");
        assert!(msg.trace_carrier().is_some());
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned_and_recorded() {
        let harness = Harness::new();
        let broker = MemoryBroker::new();
        broker.close().await.unwrap();

        let result = publish(
            &Context::new(),
            harness.telemetry.as_ref(),
            &broker,
            "exchange_1",
            "event_1",
            &"hello",
        )
        .await;
        assert!(matches!(
            result,
            Err(PublishError::Client(ClientError::ConnectionClosed))
        ));

        let span = harness.span("|publish|exchange_1|event_1");
        assert!(matches!(span.status, Status::Error { .. }));
    }

    async fn noop(_cx: Context, _delivery: Delivery) -> Result<(), BoxError> {
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_consume_round_trip_links_spans() {
        let harness = Harness::new();
        let broker = MemoryBroker::new();

        let router = Router::new(|_: &Context, _: &Delivery, _: &DispatchError| false)
            .with_global_middlewares(vec![trace_propagation(harness.telemetry.clone())]);
        router.register_event_handler("event_1", noop, &[]);
        broker
            .consume(
                ConsumerSpec::new("exchange_1", "queue_1").routing_key("event_1"),
                Arc::new(router),
            )
            .await
            .unwrap();

        let parent = harness.telemetry.start_in(
            "request".into(),
            SpanKind::Server,
            vec![],
            &Context::new(),
        );
        publish(
            &parent,
            harness.telemetry.as_ref(),
            &broker,
            "exchange_1",
            "event_1",
            &"hello",
        )
        .await
        .unwrap();
        parent.span().end();

        let settlements =
            tokio::time::timeout(Duration::from_secs(5), broker.wait_for_settlements(1))
                .await
                .unwrap();
        assert_eq!(settlements[0].outcome, Outcome::Ack);

        let request = harness.span("request");
        let publish = harness.span("|publish|exchange_1|event_1");
        let consume = harness.finished("|consume|exchange_1|event_1").await;

        assert_eq!(publish.parent_span_id, request.span_context.span_id());
        assert_eq!(consume.parent_span_id, publish.span_context.span_id());
        assert_eq!(
            consume.span_context.trace_id(),
            request.span_context.trace_id()
        );
        assert_ne!(consume.parent_span_id, SpanId::INVALID);
    }
}
