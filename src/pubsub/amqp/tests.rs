use std::time::Duration;

use super::*;

fn pubsub_with_config(config: Config) -> Inner {
    Inner {
        conn_mgr: ConnectionManager::new(
            config.uri.clone(),
            config.max_connect_retries as usize,
            config.max_connection_channels,
        ),
        lifecycle: Lifecycle::new("test"),
        publisher: Mutex::new(None),
        declared: Mutex::new(HashSet::new()),
        closed_tx: watch::channel(false).0,
        config,
    }
}

#[test]
fn redelivery_interval_defaults() {
    let p = pubsub_with_config(Config::default());

    assert_eq!(p.redelivery_interval(0), Duration::ZERO);
    assert_eq!(p.redelivery_interval(1), Duration::from_secs(2));
    assert_eq!(p.redelivery_interval(2), Duration::from_secs(3));
    assert_eq!(p.redelivery_interval(3), Duration::from_millis(4500));
}

#[test]
fn redelivery_interval_is_capped() {
    let p = pubsub_with_config(Config {
        max_redelivery_interval: Duration::from_millis(200),
        ..Default::default()
    });

    assert_eq!(p.redelivery_interval(1), Duration::from_millis(200));
    assert_eq!(p.redelivery_interval(7), Duration::from_millis(200));
}

#[test]
fn queue_names() {
    assert_eq!(wait_queue("activities"), "activities.wait");
    assert_eq!(redelivery_queue("activities"), "activities.redelivery");
}

#[test]
fn headers_round_trip() {
    let mut msg = Message::new("payload");
    msg.metadata.insert("actor-iri".to_string(), "https://w.example/svc".to_string());

    let headers = build_headers(&msg, 3);

    let attempt = headers
        .inner()
        .get(DELIVERY_ATTEMPT_HEADER)
        .and_then(header_int)
        .unwrap();
    assert_eq!(attempt, 3);

    let actor = headers.inner().get("actor-iri").unwrap();
    match actor {
        AMQPValue::LongString(s) => {
            assert_eq!(std::str::from_utf8(s.as_bytes()).unwrap(), "https://w.example/svc");
        }
        other => panic!("unexpected header value: {other:?}"),
    }
}

#[test]
fn header_int_accepts_integer_widths() {
    assert_eq!(header_int(&AMQPValue::LongLongInt(4)), Some(4));
    assert_eq!(header_int(&AMQPValue::LongInt(4)), Some(4));
    assert_eq!(header_int(&AMQPValue::ShortInt(4)), Some(4));
    assert_eq!(header_int(&AMQPValue::LongLongInt(-1)), None);
    assert_eq!(header_int(&AMQPValue::Boolean(true)), None);
}

#[test]
fn config_defaults() {
    let config = Config::default();
    assert_eq!(config.max_connect_retries, 25);
    assert_eq!(config.max_connection_channels, 1000);
    assert_eq!(config.max_redelivery_attempts, 10);
    assert_eq!(config.redelivery_initial_interval, Duration::from_secs(2));
    assert_eq!(config.max_redelivery_interval, Duration::from_secs(60));
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test amqp_integration -- --ignored
mod amqp_integration {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::super::super::{PubSub, PublishOpts, SubscribeOpts};
    use super::*;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    fn unique_topic(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4())
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn publish_subscribe_round_trip() {
        let p = AmqpPubSub::new(Config::new(amqp_url())).await.unwrap();
        assert!(p.is_connected());

        let topic = unique_topic("round-trip");
        let mut msgs = p.subscribe(&topic).await.unwrap();

        let msg = Message::new("some payload");
        let uuid = msg.uuid.clone();
        p.publish(&topic, vec![msg]).await.unwrap();

        let received = tokio::time::timeout(Duration::from_millis(200), msgs.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed");
        assert_eq!(received.uuid, uuid);
        assert_eq!(received.payload, b"some payload");
        received.ack();

        p.close().await.unwrap();

        assert!(p.subscribe(&topic).await.unwrap_err().is_not_started());
        assert!(p
            .publish(&topic, vec![Message::new("x")])
            .await
            .unwrap_err()
            .is_not_started());
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn delayed_delivery() {
        let p = AmqpPubSub::new(Config::new(amqp_url())).await.unwrap();

        let topic = unique_topic("delayed");
        let mut msgs = p.subscribe(&topic).await.unwrap();

        let published_at = Instant::now();
        p.publish_with_opts(
            &topic,
            Message::new("payload for delayed delivery"),
            PublishOpts::with_delivery_delay(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(3), msgs.recv())
            .await
            .expect("timed out waiting for delayed message")
            .expect("channel closed");

        assert!(published_at.elapsed() >= Duration::from_secs(1));
        assert_eq!(received.payload, b"payload for delayed delivery");
        received.ack();

        p.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn pooled_subscriber_receives_all() {
        const N: usize = 100;

        let p = AmqpPubSub::new(Config {
            uri: amqp_url(),
            max_connection_channels: 5,
            ..Default::default()
        })
        .await
        .unwrap();

        let topic = unique_topic("pooled");
        let mut msgs = p
            .subscribe_with_opts(&topic, SubscribeOpts::with_pool(10))
            .await
            .unwrap();

        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let reader = tokio::spawn(async move {
            while let Some(msg) = msgs.recv().await {
                // Simulate processing before acking.
                tokio::time::sleep(Duration::from_millis(10)).await;
                msg.ack();
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == N {
                    break;
                }
            }
        });

        for _ in 0..N {
            p.publish(&topic, vec![Message::new("some payload")])
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(30), reader)
            .await
            .expect("timed out waiting for pooled messages")
            .unwrap();
        assert_eq!(received.load(Ordering::SeqCst), N);

        p.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn redelivery_attempts_reached() {
        let p = AmqpPubSub::new(Config {
            uri: amqp_url(),
            max_redelivery_attempts: 5,
            max_redelivery_interval: Duration::from_millis(200),
            redelivery_initial_interval: Duration::from_millis(100),
            ..Default::default()
        })
        .await
        .unwrap();

        let topic = unique_topic("redelivery");
        let mut msgs = p.subscribe(&topic).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        tokio::spawn(async move {
            while let Some(msg) = msgs.recv().await {
                // Always fail to exhaust the redelivery budget.
                msg.nack();
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        p.publish(&topic, vec![Message::new("some payload")])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 6);

        p.close().await.unwrap();
    }
}
