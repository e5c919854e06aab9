//! In-process loopback broker.
//!
//! [`MemoryBroker`] implements [`Client`] without a network. Queues are
//! bound to one exchange with exact routing keys or `#`, each queue is
//! drained by its own worker task, and every ack or nack is recorded so
//! tests and demos can observe how deliveries were settled.
//!
//! The settlement and publish logs are unbounded unless a log limit is
//! set, so long-running processes should use [`MemoryBroker::with_limits`]
//! or [`MemoryConnector::with_log_limit`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::Context;
use relay_core::{AckError, Acknowledger, Consumer, Delivery};
use relay_protocol::Publishing;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::client::{Client, ClientError, Connector, ConsumerSpec};
use crate::config::ClientConfig;

/// How many times a requeued message is redelivered before it is dropped.
pub const DEFAULT_DELIVERY_LIMIT: u32 = 3;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledged.
    Ack,
    /// Negatively acknowledged.
    Nack {
        /// Whether redelivery was requested.
        requeue: bool,
    },
}

/// One recorded ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub outcome: Outcome,
}

/// A published message as seen by the broker.
pub type PublishedMessage = (String, String, Publishing);

/// In-process broker client for tests and demos. Clones share the same
/// broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    open: AtomicBool,
    next_tag: AtomicU64,
    delivery_limit: u32,
    /// Maximum entries kept in each log. `None` keeps everything.
    log_limit: Option<usize>,
    state: Mutex<State>,
    settled: Notify,
}

#[derive(Default)]
struct State {
    bindings: Vec<Binding>,
    /// Unsettled deliveries by tag.
    pending: HashMap<u64, Pending>,
    settlements: VecDeque<Settlement>,
    /// Settlements recorded, including ones evicted from the log.
    settled_total: usize,
    published: VecDeque<PublishedMessage>,
}

/// Append to a log, evicting the oldest entries beyond `limit`.
fn record<T>(log: &mut VecDeque<T>, entry: T, limit: Option<usize>) {
    log.push_back(entry);
    if let Some(limit) = limit {
        while log.len() > limit {
            log.pop_front();
        }
    }
}

struct Binding {
    spec: ConsumerSpec,
    queue: mpsc::UnboundedSender<Delivery>,
}

struct Pending {
    exchange: String,
    routing_key: String,
    msg: Publishing,
    queue: mpsc::UnboundedSender<Delivery>,
    redeliveries: u32,
}

impl MemoryBroker {
    /// Create an open broker with [`DEFAULT_DELIVERY_LIMIT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_delivery_limit(DEFAULT_DELIVERY_LIMIT)
    }

    /// Create an open broker that redelivers a requeued message at most
    /// `limit` times.
    #[must_use]
    pub fn with_delivery_limit(limit: u32) -> Self {
        Self::with_limits(limit, None)
    }

    /// Create an open broker with a delivery limit that keeps at most
    /// `log_limit` entries in each of its settlement and publish logs.
    #[must_use]
    pub fn with_limits(delivery_limit: u32, log_limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                open: AtomicBool::new(true),
                next_tag: AtomicU64::new(0),
                delivery_limit,
                log_limit,
                state: Mutex::new(State::default()),
                settled: Notify::new(),
            }),
        }
    }

    /// Check if the broker accepts publishes and acknowledgments.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Messages accepted by [`Client::publish`], oldest first.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().await.published.iter().cloned().collect()
    }

    /// Acks and nacks received, oldest first.
    pub async fn settlements(&self) -> Vec<Settlement> {
        self.inner.state.lock().await.settlements.iter().cloned().collect()
    }

    /// Number of acks and nacks received since the broker was created.
    pub async fn settled_total(&self) -> usize {
        self.inner.state.lock().await.settled_total
    }

    /// Wait until at least `count` settlements were recorded, then return
    /// the retained log.
    pub async fn wait_for_settlements(&self, count: usize) -> Vec<Settlement> {
        loop {
            let notified = self.inner.settled.notified();
            {
                let state = self.inner.state.lock().await;
                if state.settled_total >= count {
                    return state.settlements.iter().cloned().collect();
                }
            }
            notified.await;
        }
    }

    /// Hand a message to a queue under a fresh delivery tag.
    fn enqueue(&self, state: &mut State, pending: Pending) {
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        let delivery = Delivery::from_publishing(
            pending.exchange.as_str(),
            pending.routing_key.as_str(),
            &pending.msg,
            tag,
            Arc::new(Channel(self.clone())),
        )
        .with_redelivered(pending.redeliveries > 0);

        if pending.queue.send(delivery).is_ok() {
            state.pending.insert(tag, pending);
        } else {
            warn!(
                delivery_tag = tag,
                routing_key = %pending.routing_key,
                "Queue worker gone, dropping message"
            );
        }
    }

    async fn settle(
        &self,
        delivery_tag: u64,
        multiple: bool,
        outcome: Outcome,
    ) -> Result<(), AckError> {
        if !self.is_open() {
            return Err(AckError::ChannelClosed);
        }

        let mut state = self.inner.state.lock().await;

        let tags: Vec<u64> = if multiple {
            let mut tags: Vec<u64> = state
                .pending
                .keys()
                .copied()
                .filter(|tag| *tag <= delivery_tag)
                .collect();
            tags.sort_unstable();
            tags
        } else {
            vec![delivery_tag]
        };

        let settled: Vec<(u64, Pending)> = tags
            .into_iter()
            .filter_map(|tag| state.pending.remove(&tag).map(|p| (tag, p)))
            .collect();
        if settled.is_empty() {
            return Err(AckError::Transport(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        }

        for (tag, pending) in settled {
            let settlement = Settlement {
                delivery_tag: tag,
                exchange: pending.exchange.clone(),
                routing_key: pending.routing_key.clone(),
                message_id: pending.msg.message_id.clone(),
                outcome,
            };
            record(&mut state.settlements, settlement, self.inner.log_limit);
            state.settled_total += 1;

            if outcome != (Outcome::Nack { requeue: true }) {
                continue;
            }
            if pending.redeliveries >= self.inner.delivery_limit {
                warn!(
                    message_id = %pending.msg.message_id,
                    routing_key = %pending.routing_key,
                    limit = self.inner.delivery_limit,
                    "Delivery limit reached, dropping message"
                );
                continue;
            }
            self.enqueue(
                &mut state,
                Pending {
                    redeliveries: pending.redeliveries + 1,
                    ..pending
                },
            );
        }

        drop(state);
        self.inner.settled.notify_waiters();
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Client for MemoryBroker {
    async fn publish(
        &self,
        _cx: &Context,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        msg: Publishing,
    ) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::ConnectionClosed);
        }
        if immediate {
            return Err(ClientError::PublishFailed(
                "immediate delivery is not supported".to_string(),
            ));
        }

        let mut state = self.inner.state.lock().await;

        let queues: Vec<_> = state
            .bindings
            .iter()
            .filter(|b| b.spec.exchange == exchange && b.spec.matches(routing_key))
            .map(|b| b.queue.clone())
            .collect();

        if queues.is_empty() {
            if mandatory {
                return Err(ClientError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            debug!(exchange, routing_key, "No queue bound, message discarded");
        }

        let entry = (exchange.to_string(), routing_key.to_string(), msg.clone());
        record(&mut state.published, entry, self.inner.log_limit);

        for queue in queues {
            self.enqueue(
                &mut state,
                Pending {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    msg: msg.clone(),
                    queue,
                    redeliveries: 0,
                },
            );
        }

        Ok(())
    }

    async fn consume(
        &self,
        spec: ConsumerSpec,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::ConnectionClosed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        info!(
            exchange = %spec.exchange,
            queue = %spec.queue,
            routing_keys = ?spec.routing_keys,
            consumer_tag = %spec.consumer_tag,
            "Consumer started"
        );

        let queue = spec.queue.clone();
        self.inner.state.lock().await.bindings.push(Binding {
            spec,
            queue: tx,
        });

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                consumer.consume(Context::new(), delivery).await;
            }
            debug!(queue = %queue, "Queue worker stopped");
        });

        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.inner.state.lock().await;
        state.bindings.clear();
        state.pending.clear();
        drop(state);

        self.inner.settled.notify_waiters();
        info!("Memory broker closed");
        Ok(())
    }
}

/// Acknowledger handed out with every delivery.
struct Channel(MemoryBroker);

#[async_trait]
impl Acknowledger for Channel {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AckError> {
        self.0.settle(delivery_tag, multiple, Outcome::Ack).await
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AckError> {
        self.0
            .settle(delivery_tag, multiple, Outcome::Nack { requeue })
            .await
    }
}

/// Connects a fresh [`MemoryBroker`] per call.
#[derive(Default)]
pub struct MemoryConnector {
    delivery_limit: Option<u32>,
    log_limit: Option<usize>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    /// Create a connector whose brokers use `limit` as delivery limit.
    #[must_use]
    pub fn with_delivery_limit(limit: u32) -> Self {
        Self {
            delivery_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Bound the settlement and publish logs of created brokers.
    #[must_use]
    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = Some(limit);
        self
    }

    /// Number of brokers created.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Client = MemoryBroker;

    async fn connect(&self, config: &ClientConfig) -> Result<MemoryBroker, ClientError> {
        if config.host.is_empty() {
            return Err(ClientError::ConnectionFailed("empty host".to_string()));
        }

        self.connects.fetch_add(1, Ordering::Relaxed);
        debug!(identity = %config.identity(), "Connected memory broker");

        Ok(MemoryBroker::with_limits(
            self.delivery_limit.unwrap_or(DEFAULT_DELIVERY_LIMIT),
            self.log_limit,
        ))
    }
}
