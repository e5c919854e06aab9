//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::delivery::{AckError, Acknowledger, Delivery};

/// One call that reached the acknowledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckCall {
    Ack { tag: u64, multiple: bool },
    Nack { tag: u64, multiple: bool, requeue: bool },
}

/// Acknowledger that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingAcker {
    calls: Mutex<Vec<AckCall>>,
    fail: AtomicBool,
}

impl RecordingAcker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let acker = Self::default();
        acker.fail.store(true, Ordering::SeqCst);
        Arc::new(acker)
    }

    pub fn calls(&self) -> Vec<AckCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: AckCall) -> Result<(), AckError> {
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AckError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AckError> {
        self.record(AckCall::Ack {
            tag: delivery_tag,
            multiple,
        })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AckError> {
        self.record(AckCall::Nack {
            tag: delivery_tag,
            multiple,
            requeue,
        })
    }
}

/// A delivery on `routing_key` paired with its recording acknowledger.
pub fn delivery(routing_key: &str) -> (Delivery, Arc<RecordingAcker>) {
    let acker = RecordingAcker::new();
    let delivery = Delivery::new(1, acker.clone())
        .with_exchange("exchange_1")
        .with_routing_key(routing_key)
        .with_message_id("msg-1")
        .with_body(b"hello".to_vec());
    (delivery, acker)
}
