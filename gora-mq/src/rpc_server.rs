use crate::{
    connection::BrokerConnection,
    errors::{MqError, Result},
    mq_metrics::{RPC_HANDLER_FAILURES_TOTAL, MALFORMED_MESSAGES_TOTAL, RPC_SERVER_REQUESTS_TOTAL},
    rpc_methods::{RpcArgs, RpcMethods},
};

use futures::StreamExt;
use gora_core::broker::{DeliveryStream, QueueOptions};
use gora_core::message::{Delivery, MessageProperties, RpcRequest, RpcResponse};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Failure reason sent back when a handler panics.
pub const HANDLER_PANICKED: &str = "handler panicked";

pub struct RpcServerBuilder {
    conn: Arc<BrokerConnection>,
    name: String,
    methods: RpcMethods,
    span: Option<Span>,
}

impl RpcServerBuilder {
    /// Span under which the server logs. Defaults to an `rpc_server` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Declares the request queue `name` and starts serving it.
    pub async fn init(self) -> Result<RpcServer> {
        let channel = self.conn.channel()?;
        channel
            .declare_queue(&self.name, QueueOptions::transient())
            .await?;
        let consumer = channel.consume(&self.name).await?;

        let span = self
            .span
            .unwrap_or_else(|| info_span!("rpc_server", queue = %self.name));
        let methods = Arc::new(self.methods);

        span.in_scope(|| info!(methods = ?methods.names(), "rpc server listening"));

        let serve_task = tokio::spawn(
            serve(consumer.stream, Arc::clone(&self.conn), methods).instrument(span.clone()),
        );

        Ok(RpcServer {
            name: self.name,
            conn: self.conn,
            consumer_tag: Mutex::new(Some(consumer.tag)),
            serve_task: Mutex::new(Some(serve_task)),
            span,
        })
    }
}

/// Serves a named request queue, dispatching each request to the handler
/// registered for its method and replying on the caller's reply queue.
///
/// Requests are handled concurrently, a failing or panicking handler only
/// affects its own reply.
pub struct RpcServer {
    name: String,
    conn: Arc<BrokerConnection>,
    consumer_tag: Mutex<Option<String>>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl RpcServer {
    pub fn builder(
        conn: Arc<BrokerConnection>,
        name: impl Into<String>,
        methods: RpcMethods,
    ) -> RpcServerBuilder {
        RpcServerBuilder {
            conn,
            name: name.into(),
            methods,
            span: None,
        }
    }

    pub async fn init(
        conn: Arc<BrokerConnection>,
        name: impl Into<String>,
        methods: RpcMethods,
    ) -> Result<RpcServer> {
        RpcServer::builder(conn, name, methods).init().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops consuming requests. Requests already being handled still reply.
    /// Broker-side errors while cancelling are logged only.
    pub async fn close(&self) {
        if let Some(tag) = self.consumer_tag.lock().await.take() {
            let cancelled = match self.conn.channel() {
                Ok(channel) => channel.cancel(&tag).await.map_err(MqError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = cancelled {
                self.span
                    .in_scope(|| warn!(error = %e, "failed to cancel request consumer"));
            }
        }
        // the serve loop ends with the stream; detach it
        drop(self.serve_task.lock().await.take());

        self.span.in_scope(|| info!("rpc server closed"));
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer").field("name", &self.name).finish()
    }
}

async fn serve(mut stream: DeliveryStream, conn: Arc<BrokerConnection>, methods: Arc<RpcMethods>) {
    while let Some(delivery) = stream.next().await {
        let conn = Arc::clone(&conn);
        let methods = Arc::clone(&methods);
        tokio::spawn(handle_request(conn, methods, delivery).in_current_span());
    }
    debug!("request stream ended");
}

async fn handle_request(conn: Arc<BrokerConnection>, methods: Arc<RpcMethods>, delivery: Delivery) {
    let Delivery {
        delivery_tag,
        properties,
        body,
        ..
    } = delivery;

    let (Some(correlation_id), Some(reply_to)) = (properties.correlation_id, properties.reply_to)
    else {
        warn!(delivery_tag, "request without correlation id or reply queue dropped");
        counter!(MALFORMED_MESSAGES_TOTAL.name).increment(1);
        return;
    };

    let response = match serde_json::from_slice::<RpcRequest>(&body) {
        Ok(request) => invoke(&methods, request).await,
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "malformed rpc request");
            counter!(MALFORMED_MESSAGES_TOTAL.name).increment(1);
            RpcResponse::failure(format!("malformed request: {}", e))
        }
    };

    let body = match serde_json::to_vec(&response) {
        Ok(body) => body,
        Err(e) => {
            error!(correlation_id = %correlation_id, error = %e, "unable to encode rpc reply");
            return;
        }
    };

    let properties = MessageProperties::default().with_correlation_id(correlation_id.as_str());
    if let Err(e) = conn.send_to_queue(&reply_to, body, properties).await {
        error!(correlation_id = %correlation_id, reply_to = %reply_to, error = %e, "failed to send rpc reply");
    }
}

async fn invoke(methods: &RpcMethods, request: RpcRequest) -> RpcResponse {
    let RpcRequest { method, args } = request;

    let Some(handler) = methods.get(&method) else {
        warn!(method = %method, "unknown rpc method");
        counter!(RPC_SERVER_REQUESTS_TOTAL.name, "method" => method, "outcome" => "unknown_method")
            .increment(1);
        return RpcResponse::UnknownMethod;
    };

    // own task, so a panicking handler surfaces as a JoinError
    let task = tokio::spawn(async move { handler.call(RpcArgs::new(args)).await }.in_current_span());

    let (response, outcome) = match task.await {
        Ok(Ok(data)) => (RpcResponse::Success(data), "success"),
        Ok(Err(e)) => {
            warn!(method = %method, error = %e, "rpc handler failed");
            counter!(RPC_HANDLER_FAILURES_TOTAL.name).increment(1);
            (RpcResponse::Failure(e.to_string()), "failure")
        }
        Err(e) => {
            error!(method = %method, error = %e, "rpc handler panicked");
            counter!(RPC_HANDLER_FAILURES_TOTAL.name).increment(1);
            (RpcResponse::failure(HANDLER_PANICKED), "failure")
        }
    };

    debug!(method = %method, outcome, "rpc request handled");
    counter!(RPC_SERVER_REQUESTS_TOTAL.name, "method" => method, "outcome" => outcome).increment(1);
    response
}
