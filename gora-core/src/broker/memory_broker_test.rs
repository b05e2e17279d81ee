use super::*;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;

const URL: &str = "memory://test";

async fn open_channel(broker: &MemoryBroker) -> Arc<dyn Channel> {
    broker
        .connect(&BrokerConfig::new(URL))
        .await
        .expect("failed to open channel")
}

async fn next(consumer: &mut Consumer) -> Option<Delivery> {
    timeout(Duration::from_millis(200), consumer.stream.next())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_connect_rejects_wrong_url_and_credentials() {
    let broker = MemoryBroker::with_credentials(URL, "gora", "secret");

    let err = broker
        .connect(&BrokerConfig::new("memory://elsewhere"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BrokerError::Unreachable(_)));

    let err = broker.connect(&BrokerConfig::new(URL)).await.err().unwrap();
    assert!(matches!(err, BrokerError::AuthenticationFailed(_)));

    let err = broker
        .connect(&BrokerConfig::new(URL).with_credentials("gora", "wrong"))
        .await
        .err()
        .unwrap();
    assert_eq!(err, BrokerError::AuthenticationFailed("gora".to_string()));

    assert!(broker
        .connect(&BrokerConfig::new(URL).with_credentials("gora", "secret"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_generated_queue_names_are_unique() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;

    let q1 = channel.declare_queue("", QueueOptions::private()).await.unwrap();
    let q2 = channel.declare_queue("", QueueOptions::private()).await.unwrap();
    assert!(q1.starts_with("amq.gen-"));
    assert_ne!(q1, q2);
}

#[tokio::test]
async fn test_backlog_is_flushed_to_late_consumer() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    channel.declare_queue("rpc.test", QueueOptions::transient()).await.unwrap();

    for i in 0..3u8 {
        channel
            .send_to_queue("rpc.test", vec![i], MessageProperties::default())
            .await
            .unwrap();
    }
    assert_eq!(broker.backlog_len("rpc.test"), 3);

    let mut consumer = channel.consume("rpc.test").await.unwrap();
    for i in 0..3u8 {
        let delivery = next(&mut consumer).await.expect("missing delivery");
        assert_eq!(delivery.body, vec![i]);
        assert_eq!(delivery.routing_key, "rpc.test");
    }
    assert_eq!(broker.backlog_len("rpc.test"), 0);
}

#[tokio::test]
async fn test_properties_travel_with_the_message() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    channel.declare_queue("q", QueueOptions::transient()).await.unwrap();
    let mut consumer = channel.consume("q").await.unwrap();

    let props = MessageProperties::default()
        .with_correlation_id("42")
        .with_reply_to("amq.gen-reply");
    channel.send_to_queue("q", b"{}".to_vec(), props.clone()).await.unwrap();

    let delivery = next(&mut consumer).await.unwrap();
    assert_eq!(delivery.properties, props);
}

#[tokio::test]
async fn test_send_to_missing_queue_is_dropped_silently() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    assert!(channel
        .send_to_queue("nobody.home", vec![1], MessageProperties::default())
        .await
        .is_ok());
    assert!(!broker.queue_exists("nobody.home"));
}

#[tokio::test]
async fn test_round_robin_between_consumers() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    channel.declare_queue("work", QueueOptions::transient()).await.unwrap();
    let mut c1 = channel.consume("work").await.unwrap();
    let mut c2 = channel.consume("work").await.unwrap();

    for i in 0..4u8 {
        channel
            .send_to_queue("work", vec![i], MessageProperties::default())
            .await
            .unwrap();
    }

    assert_eq!(next(&mut c1).await.unwrap().body, vec![0]);
    assert_eq!(next(&mut c2).await.unwrap().body, vec![1]);
    assert_eq!(next(&mut c1).await.unwrap().body, vec![2]);
    assert_eq!(next(&mut c2).await.unwrap().body, vec![3]);
}

#[tokio::test]
async fn test_topic_routing_delivers_once_per_queue() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    channel.declare_exchange("topic", ExchangeKind::Topic).await.unwrap();
    let queue = channel.declare_queue("", QueueOptions::private()).await.unwrap();

    channel.bind_queue(&queue, "topic", "cluster.load.#").await.unwrap();
    channel.bind_queue(&queue, "topic", "cluster.*.agentA").await.unwrap();
    // same binding twice is a no-op
    channel.bind_queue(&queue, "topic", "cluster.load.#").await.unwrap();
    assert_eq!(broker.bindings("topic", &queue).len(), 2);

    let mut consumer = channel.consume(&queue).await.unwrap();
    channel
        .publish("topic", "cluster.load.agentA", b"x".to_vec(), MessageProperties::default())
        .await
        .unwrap();
    channel
        .publish("topic", "other.key", b"y".to_vec(), MessageProperties::default())
        .await
        .unwrap();

    let delivery = next(&mut consumer).await.unwrap();
    assert_eq!(delivery.body, b"x".to_vec());
    assert_eq!(delivery.exchange, "topic");
    assert!(next(&mut consumer).await.is_none());
}

#[tokio::test]
async fn test_unbind_stops_routing() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    channel.declare_exchange("topic", ExchangeKind::Topic).await.unwrap();
    let queue = channel.declare_queue("", QueueOptions::private()).await.unwrap();
    channel.bind_queue(&queue, "topic", "a.b").await.unwrap();
    channel.unbind_queue(&queue, "topic", "a.b").await.unwrap();

    let mut consumer = channel.consume(&queue).await.unwrap();
    channel
        .publish("topic", "a.b", vec![1], MessageProperties::default())
        .await
        .unwrap();
    assert!(next(&mut consumer).await.is_none());
}

#[tokio::test]
async fn test_publish_to_unknown_exchange_fails() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    let err = channel
        .publish("missing", "a", vec![], MessageProperties::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err, BrokerError::ExchangeNotFound("missing".to_string()));
}

#[tokio::test]
async fn test_exchange_redeclare_with_other_kind_fails() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    channel.declare_exchange("topic", ExchangeKind::Topic).await.unwrap();
    channel.declare_exchange("topic", ExchangeKind::Topic).await.unwrap();
    let err = channel
        .declare_exchange("topic", ExchangeKind::Fanout)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BrokerError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_auto_delete_queue_removed_after_last_cancel() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    channel.declare_queue("rpc.cm", QueueOptions::transient()).await.unwrap();

    let mut consumer = channel.consume("rpc.cm").await.unwrap();
    channel.cancel(&consumer.tag).await.unwrap();

    assert!(!broker.queue_exists("rpc.cm"));
    assert!(next(&mut consumer).await.is_none());

    // second cancel reports the missing consumer
    let err = channel.cancel(&consumer.tag).await.err().unwrap();
    assert!(matches!(err, BrokerError::ConsumerNotFound(_)));
}

#[tokio::test]
async fn test_exclusive_queue_is_private_to_its_channel() {
    let broker = MemoryBroker::new(URL);
    let owner = open_channel(&broker).await;
    let other = open_channel(&broker).await;

    let queue = owner.declare_queue("", QueueOptions::private()).await.unwrap();
    let err = other.consume(&queue).await.err().unwrap();
    assert!(matches!(err, BrokerError::ResourceLocked(_)));

    owner.close().await.unwrap();
    assert!(!broker.queue_exists(&queue));
}

#[tokio::test]
async fn test_closed_channel_rejects_operations() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    channel.close().await.unwrap();
    // closing twice is fine
    channel.close().await.unwrap();

    assert!(!channel.is_open());
    let err = channel
        .declare_queue("", QueueOptions::private())
        .await
        .err()
        .unwrap();
    assert_eq!(err, BrokerError::ChannelClosed);
}

#[tokio::test]
async fn test_shutdown_ends_streams_and_refuses_connections() {
    let broker = MemoryBroker::new(URL);
    let channel = open_channel(&broker).await;
    let queue = channel.declare_queue("", QueueOptions::private()).await.unwrap();
    let mut consumer = channel.consume(&queue).await.unwrap();

    broker.shutdown();

    assert!(next(&mut consumer).await.is_none());
    assert!(!channel.is_open());
    assert_eq!(
        channel
            .send_to_queue(&queue, vec![], MessageProperties::default())
            .await
            .err(),
        Some(BrokerError::ChannelClosed)
    );
    assert!(matches!(
        broker.connect(&BrokerConfig::new(URL)).await.err(),
        Some(BrokerError::Unreachable(_))
    ));
}
