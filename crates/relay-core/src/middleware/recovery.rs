//! Panic containment for consumers.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::Context;
use tracing::{error, warn};

use crate::consumer::{Consumer, Middleware};
use crate::delivery::{AckError, Delivery};

/// Called with the payload of a recovered panic.
pub type PanicCallback = Arc<dyn Fn(&Context, &Delivery, &(dyn Any + Send)) + Send + Sync>;

/// Contain panics raised by the wrapped consumer and report them to
/// `callback`.
///
/// The delivery is left as the wrapped consumer left it. A panic inside a
/// handler skips the router's settlement, so pair this with a transport that
/// redelivers unsettled messages, or use [`panic_recovery_with_nack`].
pub fn panic_recovery<F>(callback: F) -> Middleware
where
    F: Fn(&Context, &Delivery, &(dyn Any + Send)) + Send + Sync + 'static,
{
    recovery(Arc::new(callback), false)
}

/// Like [`panic_recovery`], but always issues `nack(false, false)` once the
/// wrapped consumer returns or panics.
///
/// The nack is a no-op when the delivery was already settled, so a delivery
/// is never left unacknowledged after a panic.
pub fn panic_recovery_with_nack<F>(callback: F) -> Middleware
where
    F: Fn(&Context, &Delivery, &(dyn Any + Send)) + Send + Sync + 'static,
{
    recovery(Arc::new(callback), true)
}

fn recovery(callback: PanicCallback, nack_on_exit: bool) -> Middleware {
    Arc::new(move |next| {
        Arc::new(RecoveryConsumer {
            next,
            callback: Arc::clone(&callback),
            nack_on_exit,
        })
    })
}

struct RecoveryConsumer {
    next: Arc<dyn Consumer>,
    callback: PanicCallback,
    nack_on_exit: bool,
}

#[async_trait]
impl Consumer for RecoveryConsumer {
    async fn consume(&self, cx: Context, delivery: Delivery) {
        let outcome = AssertUnwindSafe(self.next.consume(cx.clone(), delivery.clone()))
            .catch_unwind()
            .await;

        if self.nack_on_exit {
            match delivery.nack(false, false).await {
                Ok(()) | Err(AckError::AlreadySettled(_)) => {}
                Err(err) => warn!(
                    routing_key = %delivery.routing_key,
                    message_id = %delivery.message_id,
                    error = %err,
                    "Safety-net NACK failed"
                ),
            }
        }

        if let Err(payload) = outcome {
            error!(
                routing_key = %delivery.routing_key,
                message_id = %delivery.message_id,
                panic = %panic_message(payload.as_ref()),
                "Recovered from panic in consumer"
            );
            (self.callback)(&cx, &delivery, payload.as_ref());
        }
    }
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{combine, consumer_fn};
    use crate::error::{BoxError, DispatchError};
    use crate::router::Router;
    use crate::test_support::{self, AckCall};
    use std::sync::Mutex;

    fn panicking() -> Arc<dyn Consumer> {
        consumer_fn(|_cx, _delivery| async move {
            panic!("handler exploded");
        })
    }

    fn capture() -> (
        Arc<Mutex<Vec<String>>>,
        impl Fn(&Context, &Delivery, &(dyn Any + Send)) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = move |_cx: &Context, d: &Delivery, payload: &(dyn Any + Send)| {
            sink.lock()
                .unwrap()
                .push(format!("{}:{}", d.routing_key, panic_message(payload)));
        };
        (seen, callback)
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (seen, callback) = capture();
        let chain = combine(panicking(), &[panic_recovery(callback)]);

        let (delivery, acker) = test_support::delivery("event_1");
        chain.consume(Context::new(), delivery).await;

        assert_eq!(*seen.lock().unwrap(), vec!["event_1:handler exploded"]);
        assert!(acker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_safety_net_nacks_after_panic() {
        let (seen, callback) = capture();
        let chain = combine(panicking(), &[panic_recovery_with_nack(callback)]);

        let (delivery, acker) = test_support::delivery("event_1");
        chain.consume(Context::new(), delivery).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(
            acker.calls(),
            vec![AckCall::Nack {
                tag: 1,
                multiple: false,
                requeue: false
            }]
        );
    }

    #[tokio::test]
    async fn test_safety_net_is_noop_after_router_ack() {
        async fn ok(_cx: Context, _d: Delivery) -> Result<(), BoxError> {
            Ok(())
        }

        let (seen, callback) = capture();
        let router = Router::new(|_: &Context, _: &Delivery, _: &DispatchError| false)
            .with_global_middlewares(vec![panic_recovery_with_nack(callback)]);
        router.register_event_handler("event_1", ok, &[]);

        let (delivery, acker) = test_support::delivery("event_1");
        router.consume(Context::new(), delivery).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(acker.calls(), vec![AckCall::Ack { tag: 1, multiple: false }]);
    }

    #[tokio::test]
    async fn test_panic_inside_router_handler() {
        async fn explode(_cx: Context, _d: Delivery) -> Result<(), BoxError> {
            panic!("inside handler");
        }

        let (seen, callback) = capture();
        let router = Router::new(|_: &Context, _: &Delivery, _: &DispatchError| false)
            .with_global_middlewares(vec![panic_recovery_with_nack(callback)]);
        router.register_event_handler("event_1", explode, &[]);

        let (delivery, acker) = test_support::delivery("event_1");
        router.consume(Context::new(), delivery).await;

        assert_eq!(*seen.lock().unwrap(), vec!["event_1:inside handler"]);
        assert_eq!(acker.calls().len(), 1);
    }

    #[test]
    fn test_panic_message_payloads() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");

        let other: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
