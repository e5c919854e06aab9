//! Trace-context propagation for consumers.
//!
//! Reads the trace carrier a publisher stored in the message headers and
//! runs the wrapped consumer inside a `|consume|{exchange}|{routing_key}`
//! span. A missing or broken carrier never fails the delivery.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use relay_protocol::{decode_carrier, TRACE_CARRIER_HEADER};
use tracing::debug;

use crate::consumer::{Consumer, Middleware};
use crate::delivery::Delivery;
use crate::telemetry::{consume_span_name, SpanGuard, Telemetry};

/// Run the wrapped consumer inside a consumer span linked to the
/// publisher's span.
///
/// - Carrier header present and valid: the span is a child of the remote
///   publisher span.
/// - Carrier header absent: the span is a child of the incoming context.
/// - Carrier header present but undecodable: the span starts a new trace.
///
/// The span is ended when the wrapped call returns or unwinds.
pub fn trace_propagation<T>(telemetry: Arc<Telemetry<T>>) -> Middleware
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    Arc::new(move |next| {
        Arc::new(TraceConsumer {
            next,
            telemetry: Arc::clone(&telemetry),
        })
    })
}

struct TraceConsumer<T> {
    next: Arc<dyn Consumer>,
    telemetry: Arc<Telemetry<T>>,
}

impl<T> TraceConsumer<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    /// Context the consumer span is parented to, and the context it is
    /// attached to for the downstream call.
    fn parents(&self, cx: &Context, delivery: &Delivery) -> (Context, Context) {
        if !delivery.headers.contains_key(TRACE_CARRIER_HEADER) {
            return (cx.clone(), cx.clone());
        }

        let extracted = decode_carrier(&delivery.headers)
            .and_then(|carrier| self.telemetry.extract(cx, &carrier));

        match extracted {
            Some(remote) => (remote.clone(), remote),
            None => {
                debug!(
                    message_id = %delivery.message_id,
                    "Unreadable trace carrier, starting a new trace"
                );
                (Context::new(), cx.clone())
            }
        }
    }
}

#[async_trait]
impl<T> Consumer for TraceConsumer<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    async fn consume(&self, cx: Context, delivery: Delivery) {
        let (parent, base) = self.parents(&cx, &delivery);

        let span = self.telemetry.start_span(
            consume_span_name(&delivery.exchange, &delivery.routing_key),
            SpanKind::Consumer,
            vec![
                KeyValue::new("message_id", delivery.message_id.clone()),
                KeyValue::new("messaging.destination", delivery.exchange.clone()),
                KeyValue::new("messaging.routing_key", delivery.routing_key.clone()),
            ],
            &parent,
        );
        let traced = base.with_span(span);
        let _guard = SpanGuard::new(traced.clone());

        self.next.consume(traced, delivery).await;
    }
}
