//! The consumer capability and middleware composition.
//!
//! Everything that processes a delivery implements [`Consumer`]: the router,
//! every middleware wrapper, and whatever the transport calls. A
//! [`Middleware`] turns one consumer into another, and [`combine`] stacks a
//! list of them around a base consumer with the first entry outermost.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::Context;

use crate::delivery::Delivery;

/// Something that can process a delivery.
///
/// There is no return value: the outcome of a call is the eventual ack or
/// nack of the delivery.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Process one delivery.
    async fn consume(&self, cx: Context, delivery: Delivery);
}

/// A [`Consumer`] backed by an async closure.
pub struct ConsumerFn<F>(F);

impl<F> ConsumerFn<F> {
    /// Wrap a closure.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Consumer for ConsumerFn<F>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn consume(&self, cx: Context, delivery: Delivery) {
        (self.0)(cx, delivery).await;
    }
}

/// Build a shared consumer from an async closure.
pub fn consumer_fn<F, Fut>(f: F) -> Arc<dyn Consumer>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(ConsumerFn::new(f))
}

/// A transformation wrapping a consumer with extra behavior.
pub type Middleware = Arc<dyn Fn(Arc<dyn Consumer>) -> Arc<dyn Consumer> + Send + Sync>;

/// Build a [`Middleware`] from a closure.
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: Fn(Arc<dyn Consumer>) -> Arc<dyn Consumer> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap `consumer` in `middlewares`.
///
/// `[m1, m2, .., mn]` yields `m1(m2(..mn(consumer)..))`: `m1` is entered
/// first and left last.
#[must_use]
pub fn combine(consumer: Arc<dyn Consumer>, middlewares: &[Middleware]) -> Arc<dyn Consumer> {
    middlewares
        .iter()
        .rev()
        .fold(consumer, |next, middleware| middleware(next))
}
