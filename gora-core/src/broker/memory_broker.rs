use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    channel::{Broker, BrokerConfig, Channel, Consumer, DeliveryStream, ExchangeKind, QueueOptions},
    errors::{BrokerError, Result},
    routing::binding_matches,
};
use crate::message::{Delivery, MessageProperties};

/// MemoryBroker is an in-process broker implementing the `Broker` / `Channel` traits
/// with AMQP-like queue and exchange semantics.
///
/// Every component of a single process (or every test) that shares the same
/// `MemoryBroker` value talks to the same queues and exchanges. Nothing is persisted.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerState>,
}

#[derive(Debug)]
struct BrokerState {
    url: String,
    credentials: Option<(String, String)>,
    running: AtomicBool,
    queues: DashMap<String, QueueState>,
    exchanges: DashMap<String, ExchangeState>,
    // open flag of every live channel, flipped on shutdown
    channels: DashMap<u64, Arc<AtomicBool>>,
    next_channel_id: AtomicU64,
    next_delivery_tag: AtomicU64,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    owner: u64,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
    had_consumer: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

impl MemoryBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self::build(url.into(), None)
    }

    /// A broker that only accepts connections presenting these credentials.
    pub fn with_credentials(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::build(url.into(), Some((username.into(), password.into())))
    }

    fn build(url: String, credentials: Option<(String, String)>) -> Self {
        MemoryBroker {
            inner: Arc::new(BrokerState {
                url,
                credentials,
                running: AtomicBool::new(true),
                queues: DashMap::new(),
                exchanges: DashMap::new(),
                channels: DashMap::new(),
                next_channel_id: AtomicU64::new(1),
                next_delivery_tag: AtomicU64::new(1),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Simulates losing the broker: every channel closes, consumer streams end
    /// and new connections are refused.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for entry in self.inner.channels.iter() {
            entry.value().store(false, Ordering::SeqCst);
        }
        self.inner.channels.clear();
        // dropping the queues drops every consumer sender
        self.inner.queues.clear();
        self.inner.exchanges.clear();
        debug!(url = %self.inner.url, "memory broker shut down");
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner.queues.contains_key(queue)
    }

    /// Number of messages waiting for a consumer on `queue`.
    pub fn backlog_len(&self, queue: &str) -> usize {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Routing keys bound from `exchange` to `queue`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.inner
            .exchanges
            .get(exchange)
            .map(|ex| {
                ex.bindings
                    .iter()
                    .filter(|b| b.queue == queue)
                    .map(|b| b.routing_key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Channel>> {
        if !self.inner.running.load(Ordering::SeqCst) || config.url != self.inner.url {
            return Err(BrokerError::Unreachable(config.url.clone()));
        }

        if let Some((username, password)) = &self.inner.credentials {
            let presented = (config.username.as_deref(), config.password.as_deref());
            if presented != (Some(username.as_str()), Some(password.as_str())) {
                return Err(BrokerError::AuthenticationFailed(
                    config.username.clone().unwrap_or_else(|| "<anonymous>".to_string()),
                ));
            }
        }

        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        self.inner.channels.insert(id, open.clone());
        debug!(url = %self.inner.url, channel_id = id, "memory broker channel opened");

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.inner.clone(),
            open,
        }))
    }
}

/// Channel handed out by [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    broker: Arc<BrokerState>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) && self.broker.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

impl BrokerState {
    fn next_tag(&self) -> u64 {
        self.next_delivery_tag.fetch_add(1, Ordering::SeqCst)
    }

    // Hands the delivery to the next live consumer (round-robin) or parks it in the backlog.
    fn enqueue(&self, queue: &str, mut delivery: Delivery) -> bool {
        let mut should_delete = false;
        let routed = match self.queues.get_mut(queue) {
            Some(mut state) => {
                loop {
                    if state.consumers.is_empty() {
                        state.backlog.push_back(delivery);
                        break;
                    }
                    let idx = state.next_consumer % state.consumers.len();
                    match state.consumers[idx].tx.send(delivery) {
                        Ok(()) => {
                            state.next_consumer = idx + 1;
                            break;
                        }
                        Err(mpsc::error::SendError(returned)) => {
                            // receiver dropped without a cancel
                            delivery = returned;
                            state.consumers.remove(idx);
                            if state.consumers.is_empty() && state.options.auto_delete {
                                should_delete = true;
                                break;
                            }
                        }
                    }
                }
                true
            }
            None => false,
        };

        if should_delete {
            self.delete_queue(queue);
        }
        routed
    }

    fn delete_queue(&self, queue: &str) {
        if self.queues.remove(queue).is_some() {
            for mut exchange in self.exchanges.iter_mut() {
                exchange.bindings.retain(|b| b.queue != queue);
            }
            debug!(queue = %queue, "queue deleted");
        }
    }

    // Removes every consumer owned by `channel_id` (or only `tag` when given).
    // Returns the number of consumers removed.
    fn remove_consumers(&self, channel_id: u64, tag: Option<&str>) -> usize {
        let mut removed = 0;
        let mut to_delete = Vec::new();
        for mut queue in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|slot| {
                !(slot.channel_id == channel_id && tag.map_or(true, |t| slot.tag == t))
            });
            let delta = before - queue.consumers.len();
            if delta > 0 {
                removed += delta;
                if queue.consumers.is_empty() && queue.options.auto_delete && queue.had_consumer {
                    to_delete.push(queue.key().clone());
                }
            }
        }
        for name in to_delete {
            self.delete_queue(&name);
        }
        removed
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        match self.broker.queues.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let state = existing.get();
                if state.options.exclusive && state.owner != self.id {
                    return Err(BrokerError::ResourceLocked(name));
                }
                if state.options != options {
                    return Err(BrokerError::PreconditionFailed(format!(
                        "queue {} redeclared with different options",
                        name
                    )));
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(QueueState {
                    options,
                    owner: self.id,
                    consumers: Vec::new(),
                    next_consumer: 0,
                    backlog: VecDeque::new(),
                    had_consumer: false,
                });
                debug!(queue = %name, channel_id = self.id, "queue declared");
            }
        }

        Ok(name)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_open()?;

        let exchange = self
            .broker
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        if exchange.kind != kind {
            return Err(BrokerError::PreconditionFailed(format!(
                "exchange {} already declared as {}",
                name, exchange.kind
            )));
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;

        if !self.broker.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let mut state = self
            .broker
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;

        let mut state = self
            .broker
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        state
            .bindings
            .retain(|b| !(b.queue == queue && b.routing_key == routing_key));
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer> {
        self.ensure_open()?;

        let mut state = self
            .broker
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if state.options.exclusive && state.owner != self.id {
            return Err(BrokerError::ResourceLocked(queue.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // flush whatever arrived before anybody listened
        while let Some(delivery) = state.backlog.pop_front() {
            let _ = tx.send(delivery);
        }

        let tag = format!("ctag-{}", Uuid::new_v4().simple());
        state.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel_id: self.id,
            tx,
        });
        state.had_consumer = true;
        debug!(queue = %queue, consumer_tag = %tag, "consumer attached");

        Ok(Consumer {
            tag,
            stream: DeliveryStream::from_unbounded(rx),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;

        if self.broker.remove_consumers(self.id, Some(consumer_tag)) == 0 {
            return Err(BrokerError::ConsumerNotFound(consumer_tag.to_string()));
        }
        debug!(consumer_tag = %consumer_tag, "consumer cancelled");
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.ensure_open()?;

        let delivery = Delivery {
            delivery_tag: self.broker.next_tag(),
            exchange: String::new(),
            routing_key: queue.to_string(),
            properties,
            body,
        };
        if !self.broker.enqueue(queue, delivery) {
            // unroutable messages are dropped, as the default exchange does
            trace!(queue = %queue, "message dropped, no such queue");
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.ensure_open()?;

        let targets: Vec<String> = {
            let state = self
                .broker
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            let mut targets: Vec<String> = Vec::new();
            for binding in &state.bindings {
                if binding_matches(state.kind, &binding.routing_key, routing_key)
                    && !targets.contains(&binding.queue)
                {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            trace!(exchange = %exchange, routing_key = %routing_key, "message matched no binding");
        }

        for queue in targets {
            let delivery = Delivery {
                delivery_tag: self.broker.next_tag(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                body: body.clone(),
            };
            self.broker.enqueue(&queue, delivery);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.channels.remove(&self.id);
        self.broker.remove_consumers(self.id, None);

        let exclusive: Vec<String> = self
            .broker
            .queues
            .iter()
            .filter(|q| q.options.exclusive && q.owner == self.id)
            .map(|q| q.key().clone())
            .collect();
        for queue in exclusive {
            self.broker.delete_queue(&queue);
        }
        debug!(channel_id = self.id, "memory broker channel closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "memory_broker_test.rs"]
mod memory_broker_test;
