use crate::{
    connection::BrokerConnection,
    errors::{MqError, Result},
    mq_metrics::{MALFORMED_MESSAGES_TOTAL, TOPIC_PUBLISH_FAILURES_TOTAL, TOPIC_PUBLISH_TOTAL},
};

use dashmap::DashMap;
use futures::StreamExt;
use gora_core::broker::{DeliveryStream, ExchangeKind, QueueOptions};
use gora_core::message::{MessageProperties, TopicMessage};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Callback invoked with the `data` of each message of its type.
pub type TopicCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicClientOptions {
    /// Name of the shared topic exchange
    pub exchange: String,
}

impl Default for TopicClientOptions {
    fn default() -> Self {
        TopicClientOptions {
            exchange: "topic".to_string(),
        }
    }
}

pub struct TopicClientBuilder {
    conn: Arc<BrokerConnection>,
    options: TopicClientOptions,
    span: Option<Span>,
}

impl TopicClientBuilder {
    pub fn with_options(mut self, options: TopicClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Span under which the client logs. Defaults to a `topic_client` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Declares the topic exchange and the client's private subscription queue.
    pub async fn init(self) -> Result<TopicClient> {
        let exchange = self.options.exchange;
        let channel = self.conn.channel()?;
        channel.declare_exchange(&exchange, ExchangeKind::Topic).await?;
        let queue = channel.declare_queue("", QueueOptions::private()).await?;

        let span = self
            .span
            .unwrap_or_else(|| info_span!("topic_client", exchange = %exchange, queue = %queue));
        span.in_scope(|| info!("topic client ready"));

        Ok(TopicClient {
            conn: self.conn,
            exchange,
            queue,
            callbacks: Arc::new(DashMap::new()),
            topics: Mutex::new(Vec::new()),
            consumer_tag: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            span,
        })
    }
}

/// Publishes and receives `{type, data}` messages on a topic exchange.
///
/// All subscriptions of a client share one private queue. Incoming messages
/// are dispatched to the callback registered for their `type`, whatever
/// pattern routed them there.
pub struct TopicClient {
    conn: Arc<BrokerConnection>,
    exchange: String,
    queue: String,
    callbacks: Arc<DashMap<String, TopicCallback>>,
    topics: Mutex<Vec<String>>,
    consumer_tag: Mutex<Option<String>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl TopicClient {
    pub fn builder(conn: Arc<BrokerConnection>) -> TopicClientBuilder {
        TopicClientBuilder {
            conn,
            options: TopicClientOptions::default(),
            span: None,
        }
    }

    pub async fn init(conn: Arc<BrokerConnection>) -> Result<TopicClient> {
        TopicClient::builder(conn).init().await
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Patterns bound so far, in subscription order.
    pub async fn topics(&self) -> Vec<String> {
        self.topics.lock().await.clone()
    }

    /// Binds `pattern` to the client's queue and routes messages of
    /// `msg_type` to `callback`. A later subscription for the same type
    /// replaces the callback. Bindings are never undone by resubscribing.
    pub async fn subscribe<F>(&self, pattern: &str, msg_type: &str, callback: F) -> Result<()>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.conn
            .channel()?
            .bind_queue(&self.queue, &self.exchange, pattern)
            .await?;

        if self
            .callbacks
            .insert(msg_type.to_string(), Arc::new(callback))
            .is_some()
        {
            self.span
                .in_scope(|| debug!(msg_type = %msg_type, "callback replaced"));
        }

        let mut topics = self.topics.lock().await;
        if !topics.iter().any(|t| t == pattern) {
            topics.push(pattern.to_string());
        }

        self.span
            .in_scope(|| info!(pattern = %pattern, msg_type = %msg_type, "subscribed"));
        Ok(())
    }

    /// Like `subscribe`, decoding `data` into `T` first. Messages whose data
    /// does not decode are logged and dropped.
    pub async fn subscribe_typed<T, F>(&self, pattern: &str, msg_type: &str, callback: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let type_name = msg_type.to_string();
        self.subscribe(pattern, msg_type, move |data| {
            match serde_json::from_value::<T>(data) {
                Ok(value) => callback(value),
                Err(e) => {
                    warn!(msg_type = %type_name, error = %e, "topic message data does not decode, dropped")
                }
            }
        })
        .await
    }

    /// Starts consuming the subscription queue. Calling it again while
    /// consuming is logged as an error and leaves the consumer untouched.
    pub async fn start(&self) -> Result<()> {
        let mut consumer_tag = self.consumer_tag.lock().await;
        if consumer_tag.is_some() {
            self.span
                .in_scope(|| error!("topic client already consuming, start ignored"));
            return Ok(());
        }

        let consumer = self.conn.channel()?.consume(&self.queue).await?;
        *consumer_tag = Some(consumer.tag);

        let task = tokio::spawn(
            dispatch(consumer.stream, Arc::clone(&self.callbacks)).instrument(self.span.clone()),
        );
        *self.dispatch_task.lock().await = Some(task);
        self.span.in_scope(|| info!("topic client consuming"));
        Ok(())
    }

    pub async fn is_consuming(&self) -> bool {
        self.consumer_tag.lock().await.is_some()
    }

    /// Publishes `message` with `topic` as routing key. Never fails, errors
    /// are logged and the message is dropped.
    pub async fn publish(&self, topic: &str, message: &TopicMessage) {
        let outcome = match serde_json::to_vec(message) {
            Ok(body) => {
                self.conn
                    .publish(&self.exchange, topic, body, MessageProperties::default())
                    .await
            }
            Err(e) => Err(MqError::from(e)),
        };

        match outcome {
            Ok(()) => {
                counter!(TOPIC_PUBLISH_TOTAL.name).increment(1);
                self.span.in_scope(
                    || debug!(topic = %topic, msg_type = %message.msg_type, "message published"),
                );
            }
            Err(e) => {
                counter!(TOPIC_PUBLISH_FAILURES_TOTAL.name).increment(1);
                self.span.in_scope(|| {
                    error!(topic = %topic, msg_type = %message.msg_type, error = %e, "failed to publish topic message")
                });
            }
        }
    }

    /// Serializes `data` and publishes it as a message of `msg_type`.
    pub async fn publish_data<T: Serialize>(&self, topic: &str, msg_type: &str, data: &T) {
        match serde_json::to_value(data) {
            Ok(data) => self.publish(topic, &TopicMessage::new(msg_type, data)).await,
            Err(e) => {
                counter!(TOPIC_PUBLISH_FAILURES_TOTAL.name).increment(1);
                self.span.in_scope(|| {
                    error!(topic = %topic, msg_type = %msg_type, error = %e, "unable to serialize topic data")
                });
            }
        }
    }

    /// Cancels the consumer if one is running and ends its dispatch task.
    pub async fn stop(&self) {
        let Some(tag) = self.consumer_tag.lock().await.take() else {
            return;
        };
        if let Some(task) = self.dispatch_task.lock().await.take() {
            task.abort();
        }
        let cancelled = match self.conn.channel() {
            Ok(channel) => channel.cancel(&tag).await.map_err(MqError::from),
            Err(e) => Err(e),
        };
        match cancelled {
            Ok(()) => self.span.in_scope(|| info!("topic client stopped")),
            Err(e) => self
                .span
                .in_scope(|| warn!(error = %e, "failed to cancel topic consumer")),
        }
    }

    /// Unbinds every subscribed pattern, then stops consuming.
    pub async fn close(&self) {
        let topics: Vec<String> = self.topics.lock().await.drain(..).collect();
        for pattern in topics {
            let unbound = match self.conn.channel() {
                Ok(channel) => channel
                    .unbind_queue(&self.queue, &self.exchange, &pattern)
                    .await
                    .map_err(MqError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = unbound {
                self.span
                    .in_scope(|| warn!(pattern = %pattern, error = %e, "failed to unbind topic"));
            }
        }
        self.stop().await;
    }
}

impl std::fmt::Debug for TopicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicClient")
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .finish()
    }
}

async fn dispatch(mut stream: DeliveryStream, callbacks: Arc<DashMap<String, TopicCallback>>) {
    while let Some(delivery) = stream.next().await {
        let message: TopicMessage = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                error!(routing_key = %delivery.routing_key, error = %e, "malformed topic message dropped");
                counter!(MALFORMED_MESSAGES_TOTAL.name).increment(1);
                continue;
            }
        };

        // clone out so the map is not locked while the callback runs
        let callback = callbacks
            .get(&message.msg_type)
            .map(|entry| Arc::clone(entry.value()));
        let Some(callback) = callback else {
            debug!(msg_type = %message.msg_type, "no callback for message type");
            continue;
        };

        let msg_type = message.msg_type;
        if catch_unwind(AssertUnwindSafe(|| callback(message.data))).is_err() {
            error!(msg_type = %msg_type, "topic callback panicked");
        }
    }
    debug!("topic stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use gora_core::broker::{BrokerConfig, MemoryBroker};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_stop_ends_the_dispatch_task() {
        let broker = MemoryBroker::new("memory://topic-client");
        let conn = BrokerConnection::connect(BrokerConfig::new("memory://topic-client"), &broker)
            .await
            .unwrap();
        let client = TopicClient::init(conn).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .subscribe("room.*", "joined", move |data| {
                let _ = tx.send(data);
            })
            .await
            .unwrap();
        client.start().await.unwrap();
        assert!(client.dispatch_task.lock().await.is_some());

        client.stop().await;
        assert!(client.dispatch_task.lock().await.is_none());
        assert!(!client.is_consuming().await);

        client.publish_data("room.1", "joined", &"alice").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
