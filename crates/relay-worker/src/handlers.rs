//! Demo handlers and worker wiring.
//!
//! Connects through the client pool, routes the configured routing keys to
//! [`handle_event`], publishes a few demo events and runs until Ctrl+C.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::TracerProvider;
use relay_core::middleware::{
    message_logger, panic_message, panic_recovery_with_nack, trace_propagation,
};
use relay_core::{BoxError, Context, Delivery, DispatchError, DispatchErrorKind, Router, Telemetry};
use relay_protocol::codec::decode_json;
use relay_transport::{Client, ClientPool, ConsumerSpec, MemoryConnector, Publisher};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics;

/// Entries kept in the in-process broker's settlement and publish logs.
const BROKER_LOG_LIMIT: usize = 1_024;

/// Payload of the demo events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoEvent {
    pub sequence: u32,
    pub text: String,
}

/// Decode and log a [`DemoEvent`].
///
/// # Errors
///
/// Returns an error if the body is not a `DemoEvent`.
pub async fn handle_event(_cx: Context, delivery: Delivery) -> Result<(), BoxError> {
    let event: DemoEvent = decode_json(&delivery.body)?;
    info!(
        routing_key = %delivery.routing_key,
        message_id = %delivery.message_id,
        sequence = event.sequence,
        text = %event.text,
        "Handled event"
    );
    Ok(())
}

/// Build the router error handler.
///
/// Every error is logged and counted. Only handler failures can be
/// requeued, and only when `requeue_on_error` is set.
pub fn error_handler(
    requeue_on_error: bool,
) -> impl Fn(&Context, &Delivery, &DispatchError) -> bool + Send + Sync + 'static {
    move |_cx: &Context, delivery: &Delivery, err: &DispatchError| {
        metrics::record_dispatch_error(err.kind().as_str());
        match err.kind() {
            DispatchErrorKind::Handler => {
                warn!(
                    message_id = %delivery.message_id,
                    error = %err,
                    requeue = requeue_on_error,
                    "Handler failed"
                );
                requeue_on_error
            }
            _ => {
                error!(message_id = %delivery.message_id, error = %err, "Dispatch error");
                false
            }
        }
    }
}

fn report_panic(_cx: &Context, delivery: &Delivery, payload: &(dyn Any + Send)) {
    metrics::record_panic(&delivery.routing_key);
    error!(
        message_id = %delivery.message_id,
        panic = %panic_message(payload),
        "Recovered handler panic"
    );
}

/// Run the worker until Ctrl+C.
///
/// # Errors
///
/// Returns an error if the broker cannot be reached, or the pool fails to
/// close cleanly.
pub async fn run_worker(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let provider = TracerProvider::builder().build();
    let telemetry = Arc::new(Telemetry::new(provider.tracer("relay")));

    let pool = ClientPool::new(MemoryConnector::default().with_log_limit(BROKER_LOG_LIMIT));
    let client = pool.register(&config.broker).await?;

    let router = build_router(&config, telemetry.clone());
    let exchange = config.consumer.exchange_name();
    let spec = config
        .consumer
        .routing_keys
        .iter()
        .fold(
            ConsumerSpec::new(exchange.clone(), config.consumer.queue_name()),
            |spec, key| spec.routing_key(key.clone()),
        );
    client.consume(spec, Arc::new(router)).await?;

    let publisher = Publisher::with_telemetry(client, telemetry);
    for sequence in 0..config.publisher.demo_messages {
        let event = DemoEvent {
            sequence,
            text: format!("demo event {}", sequence),
        };
        publisher
            .publish(&Context::new(), &exchange, &config.publisher.routing_key, &event)
            .await?;
        metrics::record_published(&config.publisher.routing_key);
    }

    info!("Relay worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    pool.close().await?;
    if let Err(e) = provider.shutdown() {
        warn!("Failed to shut down tracer provider: {}", e);
    }

    Ok(())
}

fn build_router<T>(config: &Config, telemetry: Arc<Telemetry<T>>) -> Router
where
    T: opentelemetry::trace::Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    let router = Router::new(error_handler(config.consumer.requeue_on_error))
        .with_global_middlewares(vec![
            panic_recovery_with_nack(report_panic),
            trace_propagation(telemetry),
            message_logger(),
            metrics::metrics_recorder(),
        ]);

    for key in &config.consumer.routing_keys {
        router.register_event_handler(key.clone(), handle_event, &[]);
    }

    router
}
