//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::{Consumer, Context, Delivery, Middleware};
use tracing::info;

/// Metric names.
pub mod names {
    pub const MESSAGES_CONSUMED: &str = "relay_messages_consumed_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const MESSAGES_PUBLISHED: &str = "relay_messages_published_total";
    pub const CONSUME_SECONDS: &str = "relay_consume_seconds";
    pub const DISPATCH_ERRORS: &str = "relay_dispatch_errors_total";
    pub const PANICS_TOTAL: &str = "relay_panics_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::MESSAGES_CONSUMED,
        "Total number of deliveries consumed"
    );
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of deliveries consumed");
    metrics::describe_counter!(
        names::MESSAGES_PUBLISHED,
        "Total number of messages published"
    );
    metrics::describe_histogram!(
        names::CONSUME_SECONDS,
        "Time spent consuming one delivery in seconds"
    );
    metrics::describe_counter!(
        names::DISPATCH_ERRORS,
        "Dispatch errors reported to the error handler"
    );
    metrics::describe_counter!(names::PANICS_TOTAL, "Handler panics recovered");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a published message.
pub fn record_published(routing_key: &str) {
    counter!(names::MESSAGES_PUBLISHED, "routing_key" => routing_key.to_string()).increment(1);
}

/// Record a dispatch error by kind.
pub fn record_dispatch_error(kind: &'static str) {
    counter!(names::DISPATCH_ERRORS, "kind" => kind).increment(1);
}

/// Record a recovered panic.
pub fn record_panic(routing_key: &str) {
    counter!(names::PANICS_TOTAL, "routing_key" => routing_key.to_string()).increment(1);
}

/// Count deliveries and time their consumption.
pub fn metrics_recorder() -> Middleware {
    Arc::new(|next| Arc::new(MetricsConsumer { next }))
}

struct MetricsConsumer {
    next: Arc<dyn Consumer>,
}

#[async_trait]
impl Consumer for MetricsConsumer {
    async fn consume(&self, cx: Context, delivery: Delivery) {
        let routing_key = delivery.routing_key.clone();
        counter!(names::MESSAGES_CONSUMED, "routing_key" => routing_key.clone()).increment(1);
        counter!(names::MESSAGES_BYTES).increment(delivery.body.len() as u64);

        let start = Instant::now();
        self.next.consume(cx, delivery).await;
        histogram!(names::CONSUME_SECONDS, "routing_key" => routing_key)
            .record(start.elapsed().as_secs_f64());
    }
}
