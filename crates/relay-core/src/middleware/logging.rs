//! Structured logging of consumed messages.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::Context;
use tracing::{debug, Instrument};

use crate::consumer::{Consumer, Middleware};
use crate::delivery::Delivery;

/// Log every delivery inside a `LOG_MESSAGE` span.
pub fn message_logger() -> Middleware {
    Arc::new(|next| Arc::new(LoggingConsumer { next }))
}

struct LoggingConsumer {
    next: Arc<dyn Consumer>,
}

#[async_trait]
impl Consumer for LoggingConsumer {
    async fn consume(&self, cx: Context, delivery: Delivery) {
        let span = tracing::debug_span!(
            "LOG_MESSAGE",
            id = %delivery.message_id,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
        );

        async {
            debug!(
                body_size = delivery.body.len(),
                redelivered = delivery.redelivered,
                "Consuming message"
            );
            self.next.consume(cx, delivery).await;
        }
        .instrument(span)
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{combine, consumer_fn};
    use crate::test_support;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_logger_passes_delivery_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let base = consumer_fn(move |_cx, delivery: Delivery| {
            let counter = counter.clone();
            async move {
                assert_eq!(&delivery.body[..], b"hello");
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let chain = combine(base, &[message_logger()]);
        let (delivery, _) = test_support::delivery("event_1");
        chain.consume(Context::new(), delivery).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
