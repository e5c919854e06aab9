//! Routing-key dispatch and acknowledgment.
//!
//! The router maps each delivery to one handler by routing key and turns the
//! handler's outcome into exactly one ack or nack. Failures along the way
//! are reported to the error handler and never escape `consume`.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use opentelemetry::Context;
use tracing::{debug, info, warn};

use crate::consumer::{combine, Consumer, Middleware};
use crate::delivery::Delivery;
use crate::error::{BoxError, DispatchError};

/// Business logic for one routing key.
///
/// Returning an error hands the delivery to the router's error handler,
/// which decides whether it is requeued.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one delivery.
    async fn handle(&self, cx: Context, delivery: Delivery) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, cx: Context, delivery: Delivery) -> Result<(), BoxError> {
        self(cx, delivery).await
    }
}

/// Decides whether a failed delivery is requeued.
///
/// Must not ack or nack the delivery itself; settlement belongs to the
/// router. The return value is ignored for informational reports
/// (`HandlerNotFound`, `AckFailed`, `NackFailed`).
pub type ErrorHandler = Arc<dyn Fn(&Context, &Delivery, &DispatchError) -> bool + Send + Sync>;

/// The routing-key dispatcher.
pub struct Router {
    /// Requeue policy and failure reporting.
    error_handler: ErrorHandler,
    /// Composed consumers indexed by routing key.
    routes: DashMap<String, Arc<dyn Consumer>>,
    /// Middlewares applied to every route, outside per-route ones.
    global_middlewares: Vec<Middleware>,
}

impl Router {
    /// Create a router reporting failures to `error_handler`.
    #[must_use]
    pub fn new<F>(error_handler: F) -> Self
    where
        F: Fn(&Context, &Delivery, &DispatchError) -> bool + Send + Sync + 'static,
    {
        Self {
            error_handler: Arc::new(error_handler),
            routes: DashMap::new(),
            global_middlewares: Vec::new(),
        }
    }

    /// Set the middlewares applied to every route registered afterwards.
    #[must_use]
    pub fn with_global_middlewares(mut self, middlewares: Vec<Middleware>) -> Self {
        self.set_global_middlewares(middlewares);
        self
    }

    /// Replace the global middlewares.
    ///
    /// Routes registered earlier keep the chain they were built with.
    pub fn set_global_middlewares(&mut self, middlewares: Vec<Middleware>) {
        self.global_middlewares = middlewares;
    }

    /// Register `handler` for `routing_key`.
    ///
    /// The handler is wrapped in the global middlewares followed by
    /// `middlewares`. Registering a key twice replaces the earlier handler.
    pub fn register_event_handler<H>(
        &self,
        routing_key: impl Into<String>,
        handler: H,
        middlewares: &[Middleware],
    ) where
        H: Handler + 'static,
    {
        let routing_key = routing_key.into();
        let chain: Vec<Middleware> = self
            .global_middlewares
            .iter()
            .chain(middlewares)
            .cloned()
            .collect();

        let consumer = combine(
            Arc::new(EventConsumer {
                handler: Arc::new(handler),
                error_handler: Arc::clone(&self.error_handler),
            }),
            &chain,
        );

        if self.routes.insert(routing_key.clone(), consumer).is_some() {
            info!(routing_key = %routing_key, "Replaced event handler");
        } else {
            debug!(
                routing_key = %routing_key,
                middlewares = chain.len(),
                "Registered event handler"
            );
        }
    }

    /// Check if a handler is registered for `routing_key`.
    #[must_use]
    pub fn has_route(&self, routing_key: &str) -> bool {
        self.routes.contains_key(routing_key)
    }

    /// Get all registered routing keys.
    #[must_use]
    pub fn routing_keys(&self) -> Vec<String> {
        self.routes.iter().map(|e| e.key().clone()).collect()
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            route_count: self.routes.len(),
            global_middleware_count: self.global_middlewares.len(),
        }
    }
}

#[async_trait]
impl Consumer for Router {
    async fn consume(&self, cx: Context, delivery: Delivery) {
        // Clone out of the map so no shard lock is held across the handler.
        let consumer = self
            .routes
            .get(&delivery.routing_key)
            .map(|entry| Arc::clone(entry.value()));

        match consumer {
            Some(consumer) => consumer.consume(cx, delivery).await,
            None => {
                warn!(
                    routing_key = %delivery.routing_key,
                    message_id = %delivery.message_id,
                    "No handler for routing key, dropping message"
                );
                let err = DispatchError::handler_not_found(&delivery);

                // Retrying an unroutable message is pointless.
                let _ = (self.error_handler)(&cx, &delivery, &err);
                nack(&self.error_handler, &cx, &delivery, false, err).await;
            }
        }
    }
}

/// Innermost consumer of a route: runs the handler and settles the delivery.
struct EventConsumer {
    handler: Arc<dyn Handler>,
    error_handler: ErrorHandler,
}

#[async_trait]
impl Consumer for EventConsumer {
    async fn consume(&self, cx: Context, delivery: Delivery) {
        match self.handler.handle(cx.clone(), delivery.clone()).await {
            Ok(()) => {
                if let Err(source) = delivery.ack(false).await {
                    let err = DispatchError::ack_failed(&delivery, source);
                    let _ = (self.error_handler)(&cx, &delivery, &err);
                } else {
                    debug!(
                        routing_key = %delivery.routing_key,
                        message_id = %delivery.message_id,
                        "Acked"
                    );
                }
            }
            Err(source) => {
                let err = DispatchError::handler(&delivery, source);
                let requeue = (self.error_handler)(&cx, &delivery, &err);
                debug!(
                    routing_key = %delivery.routing_key,
                    message_id = %delivery.message_id,
                    requeue,
                    error = %err,
                    "Handler failed"
                );
                nack(&self.error_handler, &cx, &delivery, requeue, err).await;
            }
        }
    }
}

/// Nack a single delivery, reporting a transport failure joined with `cause`.
async fn nack(
    error_handler: &ErrorHandler,
    cx: &Context,
    delivery: &Delivery,
    requeue: bool,
    cause: DispatchError,
) {
    if let Err(source) = delivery.nack(false, requeue).await {
        let err = DispatchError::nack_failed(delivery, source, cause);
        let _ = error_handler(cx, delivery, &err);
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of registered routing keys.
    pub route_count: usize,
    /// Number of global middlewares.
    pub global_middleware_count: usize,
}
