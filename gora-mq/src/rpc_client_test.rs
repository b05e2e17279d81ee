use super::*;
use futures::StreamExt;
use gora_core::broker::{BrokerConfig, Consumer, MemoryBroker};
use serde_json::json;

const URL: &str = "memory://rpc-client";

async fn setup() -> (MemoryBroker, Arc<BrokerConnection>) {
    let broker = MemoryBroker::new(URL);
    let conn = BrokerConnection::connect(BrokerConfig::new(URL), &broker)
        .await
        .unwrap();
    (broker, conn)
}

// a bare queue standing in for a server, so tests control the replies
async fn fake_server(conn: &BrokerConnection, name: &str) -> Consumer {
    let channel = conn.channel().unwrap();
    channel
        .declare_queue(name, QueueOptions::transient())
        .await
        .unwrap();
    channel.consume(name).await.unwrap()
}

async fn reply(conn: &BrokerConnection, request: &Delivery, body: Vec<u8>) {
    let props = MessageProperties::default()
        .with_correlation_id(request.properties.correlation_id.clone().unwrap());
    conn.channel()
        .unwrap()
        .send_to_queue(request.properties.reply_to.as_deref().unwrap(), body, props)
        .await
        .unwrap();
}

#[test]
fn test_correlation_ids_wrap_around() {
    let ids = CorrelationIds::new(3);
    let pending: DashMap<String, ()> = DashMap::new();

    let a = ids.register(&pending, ()).unwrap();
    let b = ids.register(&pending, ()).unwrap();
    assert_eq!((a.as_str(), b.as_str()), ("0", "1"));

    pending.remove("0");
    pending.remove("1");
    let c = ids.register(&pending, ()).unwrap();
    let d = ids.register(&pending, ()).unwrap();
    assert_eq!((c.as_str(), d.as_str()), ("2", "0"));
}

#[test]
fn test_correlation_ids_skip_outstanding_calls() {
    let ids = CorrelationIds::new(3);
    let pending: DashMap<String, ()> = DashMap::new();
    pending.insert("1".to_string(), ());

    assert_eq!(ids.register(&pending, ()).unwrap(), "0");
    assert_eq!(ids.register(&pending, ()).unwrap(), "2");

    let err = ids.register(&pending, ()).err().unwrap();
    assert!(matches!(err, MqError::TooManyPendingCalls(3)));
}

#[tokio::test]
async fn test_request_carries_correlation_and_reply_queue() {
    let (_broker, conn) = setup().await;
    let mut server = fake_server(&conn, "rpc.echo").await;
    let client = RpcClient::init(Arc::clone(&conn)).await.unwrap();
    assert!(client.reply_queue().starts_with("amq.gen-"));

    let call = client.request("rpc.echo", "echo", vec![json!("hi")]);
    let serve = async {
        let request = server.stream.next().await.unwrap();
        assert_eq!(request.properties.reply_to.as_deref(), Some(client.reply_queue()));
        assert_eq!(request.properties.correlation_id.as_deref(), Some("0"));

        let decoded: RpcRequest = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(decoded, RpcRequest::new("echo", vec![json!("hi")]));

        let body = serde_json::to_vec(&RpcResponse::Success(json!("hi"))).unwrap();
        reply(&conn, &request, body).await;
    };

    let (response, _) = tokio::join!(call, serve);
    assert_eq!(response.unwrap(), RpcResponse::Success(json!("hi")));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let (_broker, conn) = setup().await;
    let _server = fake_server(&conn, "rpc.silent").await;
    let client = RpcClient::init(conn).await.unwrap();

    let response = client
        .request_with_timeout("rpc.silent", "noop", vec![], Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(response, RpcResponse::Timeout);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_to_missing_queue_uses_default_timeout() {
    let (_broker, conn) = setup().await;
    let client = RpcClient::init(conn).await.unwrap();

    let started = tokio::time::Instant::now();
    let response = client.request("rpc.nobody", "noop", vec![]).await.unwrap();
    assert_eq!(response, RpcResponse::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_is_discarded() {
    let (_broker, conn) = setup().await;
    let mut server = fake_server(&conn, "rpc.slow").await;
    let client = RpcClient::init(Arc::clone(&conn)).await.unwrap();

    let response = client
        .request_with_timeout("rpc.slow", "slow", vec![], Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(response, RpcResponse::Timeout);

    let request = server.stream.next().await.unwrap();
    let body = serde_json::to_vec(&RpcResponse::Success(json!(1))).unwrap();
    reply(&conn, &request, body).await;
    tokio::task::yield_now().await;

    // the next call reuses nothing from the stale reply
    let call = client.request_with_timeout("rpc.slow", "slow", vec![], Duration::from_millis(20));
    assert_eq!(call.await.unwrap(), RpcResponse::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_reply_leaves_call_pending() {
    let (_broker, conn) = setup().await;
    let mut server = fake_server(&conn, "rpc.broken").await;
    let client = RpcClient::init(Arc::clone(&conn)).await.unwrap();

    let call = client.request_with_timeout("rpc.broken", "x", vec![], Duration::from_millis(100));
    let serve = async {
        let request = server.stream.next().await.unwrap();
        reply(&conn, &request, b"not json".to_vec()).await;
    };

    let (response, _) = tokio::join!(call, serve);
    assert_eq!(response.unwrap(), RpcResponse::Timeout);
}

#[tokio::test]
async fn test_close_rejects_pending_calls() {
    let (_broker, conn) = setup().await;
    let mut server = fake_server(&conn, "rpc.hang").await;
    let client = RpcClient::init(conn).await.unwrap();

    let call = client.request("rpc.hang", "hang", vec![]);
    let closer = async {
        server.stream.next().await.unwrap();
        assert_eq!(client.pending_calls(), 1);
        client.close().await;
    };

    let (response, _) = tokio::join!(call, closer);
    assert_eq!(response.unwrap(), RpcResponse::failure(CLIENT_CLOSED));
    assert_eq!(client.pending_calls(), 0);

    let err = client.request("rpc.hang", "hang", vec![]).await.err().unwrap();
    assert!(matches!(err, MqError::NotReady));
}

#[tokio::test]
async fn test_dropped_request_frees_its_correlation_id() {
    let (_broker, conn) = setup().await;
    let _server = fake_server(&conn, "rpc.drop").await;
    let client = RpcClient::init(conn).await.unwrap();

    let call = client.request("rpc.drop", "x", vec![]);
    // poll once so the request is registered and sent, then drop it
    let _ = tokio::time::timeout(Duration::from_millis(10), call).await;
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_typed_call_maps_outcomes() {
    let (_broker, conn) = setup().await;
    let mut server = fake_server(&conn, "rpc.typed").await;
    let client = RpcClient::init(Arc::clone(&conn)).await.unwrap();

    let calls = async {
        let ok: u32 = client.call("rpc.typed", "n", vec![]).await.unwrap();
        let failed = client.call::<u32>("rpc.typed", "n", vec![]).await;
        let unknown = client.call::<u32>("rpc.typed", "n", vec![]).await;
        (ok, failed, unknown)
    };
    let serve = async {
        let replies = [
            RpcResponse::Success(json!(5)),
            RpcResponse::failure("nope"),
            RpcResponse::UnknownMethod,
        ];
        for response in replies {
            let request = server.stream.next().await.unwrap();
            reply(&conn, &request, serde_json::to_vec(&response).unwrap()).await;
        }
    };

    let ((ok, failed, unknown), _) = tokio::join!(calls, serve);
    assert_eq!(ok, 5);
    assert!(matches!(failed, Err(RpcError::Failure(reason)) if reason == "nope"));
    assert!(matches!(unknown, Err(RpcError::UnknownMethod)));
}

#[tokio::test]
async fn test_init_fails_on_closed_connection() {
    let (broker, conn) = setup().await;
    broker.shutdown();

    let err = RpcClient::init(conn).await.err().unwrap();
    assert!(matches!(err, MqError::ChannelUnavailable));
}

#[tokio::test]
async fn test_reused_correlation_id_survives_cleanup_of_the_previous_call() {
    let (_broker, conn) = setup().await;
    let mut server = fake_server(&conn, "rpc.reuse").await;
    let client = RpcClient::builder(Arc::clone(&conn))
        .with_options(RpcClientOptions {
            correlation_modulus: 1,
            ..Default::default()
        })
        .init()
        .await
        .unwrap();

    let a = client.request("rpc.reuse", "a", vec![]);
    tokio::pin!(a);
    let request_a = tokio::select! {
        biased;
        _ = &mut a => panic!("first call resolved before its reply"),
        request = server.stream.next() => request.unwrap(),
    };
    reply(&conn, &request_a, serde_json::to_vec(&RpcResponse::Success(json!("A"))).unwrap()).await;
    // the reply is dispatched while the first call is not polled
    for _ in 0..100 {
        if client.pending_calls() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(client.pending_calls(), 0);

    let b = client.request("rpc.reuse", "b", vec![]);
    tokio::pin!(b);
    let request_b = tokio::select! {
        biased;
        _ = &mut b => panic!("second call resolved before its reply"),
        request = server.stream.next() => request.unwrap(),
    };
    assert_eq!(request_a.properties.correlation_id.as_deref(), Some("0"));
    assert_eq!(request_b.properties.correlation_id.as_deref(), Some("0"));

    assert_eq!(a.await.unwrap(), RpcResponse::Success(json!("A")));
    assert_eq!(client.pending_calls(), 1);

    reply(&conn, &request_b, serde_json::to_vec(&RpcResponse::Success(json!("B"))).unwrap()).await;
    assert_eq!(b.await.unwrap(), RpcResponse::Success(json!("B")));
}
