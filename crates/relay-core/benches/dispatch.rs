//! Router dispatch benchmarks for relay-core.

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relay_core::middleware::{message_logger, panic_recovery};
use relay_core::{AckError, Acknowledger, BoxError, Consumer, Context, Delivery, Router};

struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
    async fn ack(&self, _delivery_tag: u64, _multiple: bool) -> Result<(), AckError> {
        Ok(())
    }

    async fn nack(&self, _tag: u64, _multiple: bool, _requeue: bool) -> Result<(), AckError> {
        Ok(())
    }
}

async fn ok_handler(_cx: Context, _delivery: Delivery) -> Result<(), BoxError> {
    Ok(())
}

fn router(routes: usize) -> Router {
    let router = Router::new(|_: &Context, _: &Delivery, _: &relay_core::DispatchError| false)
        .with_global_middlewares(vec![
            panic_recovery(|_: &Context, _: &Delivery, _: &(dyn std::any::Any + Send)| {}),
            message_logger(),
        ]);
    for i in 0..routes {
        router.register_event_handler(format!("event_{}", i), ok_handler, &[]);
    }
    router
}

fn bench_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let router = router(1_000);
    let acker: Arc<dyn Acknowledger> = Arc::new(NoopAcker);

    let mut group = c.benchmark_group("dispatch");
    group.bench_function("routed", |b| {
        b.iter(|| {
            let delivery = Delivery::new(1, acker.clone()).with_routing_key("event_500");
            rt.block_on(router.consume(Context::new(), black_box(delivery)));
        })
    });
    group.bench_function("unroutable", |b| {
        b.iter(|| {
            let delivery = Delivery::new(1, acker.clone()).with_routing_key("missing");
            rt.block_on(router.consume(Context::new(), black_box(delivery)));
        })
    });
    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
