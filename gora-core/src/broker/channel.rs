use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::{fmt, pin::Pin};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::errors::{BrokerError, Result};
use crate::message::{Delivery, MessageProperties};

/// Connection settings for a broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address, for example `memory://local`
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        BrokerConfig {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Broker implementation addressed by the url scheme.
    pub fn kind(&self) -> Result<BrokerKind> {
        match self.url.split_once("://").map(|(scheme, _)| scheme) {
            Some("memory") => Ok(BrokerKind::Memory),
            Some("amqp") | Some("amqps") => Ok(BrokerKind::Amqp),
            _ => Err(BrokerError::UnsupportedUrl(self.url.clone())),
        }
    }
}

/// `memory://name` is the in-process broker, `amqp://` and `amqps://` a
/// network AMQP 0-9-1 server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Memory,
    Amqp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Private reply / subscription queue: owned by the declaring channel, gone with it.
    pub fn private() -> Self {
        QueueOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Named, shareable queue that disappears once its consumers leave.
    pub fn transient() -> Self {
        QueueOptions {
            durable: false,
            exclusive: false,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes on exact routing key equality
    Direct,
    /// Routes on `.`-separated patterns with `*` and `#` wildcards
    Topic,
    /// Routes to every bound queue
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Topic => write!(f, "topic"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Entry point to a broker: validates the connection settings and hands out a channel.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Channel>>;
}

/// A multiplexed channel to the broker. Every operation fails with
/// `BrokerError::ChannelClosed` once the channel is gone.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declares a queue, an empty `name` asks the broker to generate one.
    /// Returns the effective queue name.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;
    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;
    async fn consume(&self, queue: &str) -> Result<Consumer>;
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;
    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_open(&self) -> bool;
}

/// An active subscription on a queue. The stream ends when the consumer is
/// cancelled, its queue is deleted or the channel closes.
#[derive(Debug)]
pub struct Consumer {
    pub tag: String,
    pub stream: DeliveryStream,
}

pub struct DeliveryStream {
    inner: Pin<Box<dyn Stream<Item = Delivery> + Send>>,
}

impl DeliveryStream {
    pub fn new(stream: impl Stream<Item = Delivery> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    pub fn from_unbounded(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self::new(UnboundedReceiverStream::new(rx))
    }
}

impl Stream for DeliveryStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for DeliveryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryStream").finish_non_exhaustive()
    }
}
