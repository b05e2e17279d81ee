use crate::{
    connection::BrokerConnection,
    errors::{MqError, Result, RpcError},
    mq_metrics::{
        RPC_LATE_REPLIES_TOTAL, MALFORMED_MESSAGES_TOTAL, RPC_PENDING_CALLS,
        RPC_REQUESTS_TOTAL, RPC_TIMEOUTS_TOTAL,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::StreamExt;
use gora_core::broker::{DeliveryStream, QueueOptions};
use gora_core::message::{Delivery, MessageProperties, RpcRequest, RpcResponse};
use metrics::{counter, gauge};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Reason given to calls still pending when the client closes.
pub const CLIENT_CLOSED: &str = "client closed";

type PendingCalls = DashMap<String, PendingCall>;

/// A registered call. `seq` is unique for the client's lifetime, so cleanup
/// of a finished call never removes a later call that reused its id.
struct PendingCall {
    seq: u64,
    tx: oneshot::Sender<RpcResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcClientOptions {
    /// Correlation ids cycle through `0..correlation_modulus`
    pub correlation_modulus: u32,
    /// Timeout applied by `request` when none is given
    pub default_timeout_ms: u64,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        RpcClientOptions {
            correlation_modulus: 65536,
            default_timeout_ms: 10_000,
        }
    }
}

impl RpcClientOptions {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

pub struct RpcClientBuilder {
    conn: Arc<BrokerConnection>,
    options: RpcClientOptions,
    span: Option<Span>,
}

impl RpcClientBuilder {
    pub fn with_options(mut self, options: RpcClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Span under which the client logs. Defaults to an `rpc_client` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Declares the private reply queue and starts consuming replies.
    pub async fn init(self) -> Result<RpcClient> {
        let channel = self.conn.channel()?;
        let reply_queue = channel.declare_queue("", QueueOptions::private()).await?;
        let consumer = channel.consume(&reply_queue).await?;

        let span = self
            .span
            .unwrap_or_else(|| info_span!("rpc_client", reply_queue = %reply_queue));
        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());

        let consume_task = tokio::spawn(
            consume_replies(consumer.stream, Arc::clone(&pending)).instrument(span.clone()),
        );

        span.in_scope(|| info!("rpc client ready"));

        Ok(RpcClient {
            conn: self.conn,
            reply_queue,
            ready: AtomicBool::new(true),
            ids: CorrelationIds::new(self.options.correlation_modulus),
            next_seq: AtomicU64::new(0),
            pending,
            consumer_tag: Mutex::new(Some(consumer.tag)),
            consume_task: Mutex::new(Some(consume_task)),
            options: self.options,
            span,
        })
    }
}

/// Issues requests to named server queues and matches each reply to its
/// caller through the correlation id. Every request ends with exactly one
/// terminal `RpcResponse`.
pub struct RpcClient {
    conn: Arc<BrokerConnection>,
    reply_queue: String,
    ready: AtomicBool,
    ids: CorrelationIds,
    next_seq: AtomicU64,
    pending: Arc<PendingCalls>,
    consumer_tag: Mutex<Option<String>>,
    consume_task: Mutex<Option<JoinHandle<()>>>,
    options: RpcClientOptions,
    span: Span,
}

impl RpcClient {
    pub fn builder(conn: Arc<BrokerConnection>) -> RpcClientBuilder {
        RpcClientBuilder {
            conn,
            options: RpcClientOptions::default(),
            span: None,
        }
    }

    /// Initializes a client with default options.
    pub async fn init(conn: Arc<BrokerConnection>) -> Result<RpcClient> {
        RpcClient::builder(conn).init().await
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn options(&self) -> &RpcClientOptions {
        &self.options
    }

    /// Sends `method(args)` to the server queue `target` and waits for the
    /// reply, at most the configured default timeout.
    pub async fn request(&self, target: &str, method: &str, args: Vec<Value>) -> Result<RpcResponse> {
        self.request_with_timeout(target, method, args, self.options.default_timeout())
            .await
    }

    /// Sends `method(args)` to `target` and waits at most `timeout` for the reply.
    ///
    /// Returns `RpcResponse::Timeout` if nothing arrives in time and
    /// `RpcResponse::Failure("client closed")` if the client closes first.
    /// A request targeting a queue nobody consumes from is silently dropped by
    /// the broker and ends in a timeout.
    pub async fn request_with_timeout(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        if !self.is_ready() {
            return Err(MqError::NotReady);
        }

        let body = serde_json::to_vec(&RpcRequest::new(method, args))?;
        let (tx, mut rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let correlation_id = self.ids.register(&self.pending, PendingCall { seq, tx })?;
        // removes the pending entry if this future is dropped before completion
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: &correlation_id,
            seq,
        };
        gauge!(RPC_PENDING_CALLS.name).set(self.pending.len() as f64);

        let properties = MessageProperties::default()
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(self.reply_queue.as_str());

        self.span.in_scope(|| {
            debug!(target_queue = %target, method = %method, correlation_id = %correlation_id, "sending rpc request")
        });
        self.conn.send_to_queue(target, body, properties).await?;
        counter!(RPC_REQUESTS_TOTAL.name).increment(1);

        let response = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => RpcResponse::failure(CLIENT_CLOSED),
            Err(_) => {
                if self
                    .pending
                    .remove_if(&correlation_id, |_, call| call.seq == seq)
                    .is_some()
                {
                    self.span.in_scope(|| {
                        warn!(target_queue = %target, method = %method, correlation_id = %correlation_id, "rpc request timed out")
                    });
                    counter!(RPC_TIMEOUTS_TOTAL.name).increment(1);
                    RpcResponse::Timeout
                } else {
                    // a reply or close() took the entry right at the deadline
                    rx.await
                        .unwrap_or_else(|_| RpcResponse::failure(CLIENT_CLOSED))
                }
            }
        };

        Ok(response)
    }

    /// Typed convenience over `request`: decodes a success payload into `T`
    /// and turns every other outcome into an `RpcError`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
    ) -> std::result::Result<T, RpcError> {
        match self.request(target, method, args).await? {
            RpcResponse::Success(data) => serde_json::from_value(data).map_err(RpcError::Decode),
            RpcResponse::Failure(reason) => Err(RpcError::Failure(reason)),
            RpcResponse::Timeout => Err(RpcError::Timeout),
            RpcResponse::UnknownMethod => Err(RpcError::UnknownMethod),
        }
    }

    /// Rejects every pending call with `Failure("client closed")` and stops
    /// consuming replies. Broker-side errors while cancelling are logged only.
    pub async fn close(&self) {
        self.ready.store(false, Ordering::SeqCst);

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.tx.send(RpcResponse::failure(CLIENT_CLOSED));
            }
        }
        gauge!(RPC_PENDING_CALLS.name).set(0.0);

        if let Some(tag) = self.consumer_tag.lock().await.take() {
            let cancelled = match self.conn.channel() {
                Ok(channel) => channel.cancel(&tag).await.map_err(MqError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = cancelled {
                self.span
                    .in_scope(|| warn!(error = %e, "failed to cancel reply consumer"));
            }
        }
        if let Some(task) = self.consume_task.lock().await.take() {
            task.abort();
        }

        self.span.in_scope(|| info!("rpc client closed"));
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("reply_queue", &self.reply_queue)
            .field("ready", &self.is_ready())
            .field("pending_calls", &self.pending.len())
            .finish()
    }
}

async fn consume_replies(mut stream: DeliveryStream, pending: Arc<PendingCalls>) {
    while let Some(delivery) = stream.next().await {
        dispatch_reply(&pending, delivery);
    }
    debug!("reply stream ended");
}

fn dispatch_reply(pending: &PendingCalls, delivery: Delivery) {
    let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
        error!(delivery_tag = delivery.delivery_tag, "reply without correlation id discarded");
        counter!(MALFORMED_MESSAGES_TOTAL.name).increment(1);
        return;
    };

    // a malformed reply leaves the call pending, it ends in a timeout
    let response: RpcResponse = match serde_json::from_slice(&delivery.body) {
        Ok(response) => response,
        Err(e) => {
            error!(correlation_id = %correlation_id, error = %e, "malformed reply discarded");
            counter!(MALFORMED_MESSAGES_TOTAL.name).increment(1);
            return;
        }
    };

    match pending.remove(correlation_id) {
        Some((_, call)) => {
            let _ = call.tx.send(response);
            gauge!(RPC_PENDING_CALLS.name).set(pending.len() as f64);
        }
        None => {
            warn!(correlation_id = %correlation_id, "late reply discarded, no pending call");
            counter!(RPC_LATE_REPLIES_TOTAL.name).increment(1);
        }
    }
}

struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    correlation_id: &'a str,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let seq = self.seq;
        self.pending
            .remove_if(self.correlation_id, |_, call| call.seq == seq);
    }
}

/// Cyclic correlation id allocator. Ids still in use by a pending call are
/// skipped so that two outstanding calls never share an id.
pub(crate) struct CorrelationIds {
    next: AtomicU32,
    modulus: u32,
}

impl CorrelationIds {
    pub(crate) fn new(modulus: u32) -> Self {
        CorrelationIds {
            next: AtomicU32::new(0),
            modulus: modulus.max(1),
        }
    }

    fn next_id(&self) -> u32 {
        let modulus = self.modulus;
        match self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n + 1) % modulus))
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Allocates a free id and stores `value` under it.
    pub(crate) fn register<T>(&self, pending: &DashMap<String, T>, value: T) -> Result<String> {
        for _ in 0..self.modulus {
            let id = self.next_id().to_string();
            if let Entry::Vacant(slot) = pending.entry(id.clone()) {
                slot.insert(value);
                return Ok(id);
            }
        }
        Err(MqError::TooManyPendingCalls(self.modulus))
    }
}

#[cfg(test)]
#[path = "rpc_client_test.rs"]
mod rpc_client_test;
