//! End-to-end delivery tests: the full publish → route → enqueue → tick →
//! handler → settle pipeline with the loop actually running.

use courier_bus::{
    BreakerState, MessageBus, MessageFilter, PublishOptions, QueueOptions, RoutingStrategy,
    SubscribeOptions,
};
use courier_config::{BusConfig, DeliveryPolicy};
use courier_core::{BusSignal, DeliveryError, Error, HandlerError, Message};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep, timeout};

/// A fast-ticking config so tests settle quickly.
fn fast_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.delivery.tick_interval_ms = 5;
    config
}

/// A handler that forwards every received message into a channel.
fn recording_handler(
    tx: mpsc::UnboundedSender<Message>,
) -> impl Fn(Message) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HandlerError>> + Send>>
{
    move |message: Message| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(message);
            Ok(())
        })
    }
}

/// Poll a condition until it holds or five seconds pass.
async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return;
        }
        assert!(Instant::now() < deadline, "condition not met within 5s");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn end_to_end_delivery() {
    let bus = MessageBus::new(fast_config());
    let loop_handle = bus.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe("orders.#", recording_handler(tx), SubscribeOptions::default())
        .await
        .unwrap();

    let receipt = bus
        .publish("orders.created", json!({"id": 42}), PublishOptions::default())
        .await
        .unwrap();
    assert!(receipt.routed);

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .unwrap();
    assert_eq!(received.topic, "orders.created");
    assert_eq!(received.payload, json!({"id": 42}));

    let status = bus.status().await;
    assert_eq!(status.delivered, 1);
    assert_eq!(status.failed, 0);

    bus.stop();
    drop(loop_handle);
}

#[tokio::test]
async fn wildcard_subscription_receives_only_matching_topics() {
    let bus = MessageBus::new(fast_config());
    bus.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe("security.#", recording_handler(tx), SubscribeOptions::default())
        .await
        .unwrap();

    bus.publish("security.alert.raised", Value::Null, PublishOptions::default())
        .await
        .unwrap();
    // Unroutable: nothing is bound under billing
    bus.publish("billing.invoice", Value::Null, PublishOptions::default())
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(received.topic, "security.alert.raised");

    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(bus.status().await.unroutable, 1);
    bus.stop();
}

#[tokio::test]
async fn at_least_once_retry_then_success() {
    let bus = MessageBus::new(fast_config());
    bus.start();
    let mut signals = bus.subscribe_signals();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    bus.subscribe(
        "flaky.job",
        move |_message: Message| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    Err(HandlerError::new("transient failure"))
                } else {
                    Ok(())
                }
            }
        },
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    bus.publish(
        "flaky.job",
        Value::Null,
        PublishOptions {
            max_retries: Some(5),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Exactly one delivered signal, two failed signals, zero dead-letters
    let mut failed = 0;
    loop {
        let signal = timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("timed out waiting for signals")
            .unwrap();
        match signal.name() {
            "message:failed" => failed += 1,
            "message:delivered" => break,
            _ => {}
        }
    }
    assert_eq!(failed, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let stats = bus.queue_stats().await;
    assert_eq!(stats[0].dead_letters, 0);
    assert_eq!(bus.status().await.delivered, 1);
    bus.stop();
}

#[tokio::test]
async fn dead_letter_after_retry_exhaustion() {
    let bus = MessageBus::new(fast_config());
    bus.start();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    bus.subscribe(
        "doomed.job",
        move |_message: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(HandlerError::new("permanent failure")) }
        },
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    bus.publish(
        "doomed.job",
        Value::Null,
        PublishOptions {
            max_retries: Some(2),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    eventually(|| async { bus.queue_stats().await[0].dead_letters == 1 }).await;

    // Initial attempt plus two retries, then the budget is spent
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let status = bus.status().await;
    assert_eq!(status.failed, 3);
    assert_eq!(status.delivered, 0);
    bus.stop();
}

#[tokio::test]
async fn breaker_isolates_persistently_failing_consumer() {
    let mut config = fast_config();
    config.breaker.failure_threshold = 2;
    config.breaker.timeout_ms = 60_000;
    let bus = MessageBus::new(config);
    bus.start();

    let invocations = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&invocations);
    let id = bus
        .subscribe(
            "stuck.consumer",
            move |_message: Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(HandlerError::new("always fails")) }
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    bus.publish(
        "stuck.consumer",
        Value::Null,
        PublishOptions {
            max_retries: Some(5),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    eventually(|| async { bus.queue_stats().await[0].dead_letters == 1 }).await;

    // The breaker opened after two invocations; the remaining four attempts
    // were rejected without reaching the handler
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(bus.status().await.failed, 6);

    let breakers = bus.circuit_breaker_stats().await;
    assert_eq!(breakers[&id].state, BreakerState::Open);

    let health = bus.health_check().await;
    assert!(!health.healthy);
    assert_eq!(health.open_circuit_breakers, 1);
    bus.stop();
}

#[tokio::test]
async fn request_reply_roundtrip() {
    let bus = Arc::new(MessageBus::new(fast_config()));
    bus.start();

    let replier = Arc::clone(&bus);
    bus.subscribe(
        "config.get",
        move |message: Message| {
            let bus = Arc::clone(&replier);
            async move {
                bus.reply(&message, json!({"value": 50}))
                    .await
                    .map_err(|err| HandlerError::new(err.to_string()))
            }
        },
        SubscribeOptions::default(),
    )
    .await
    .unwrap();

    let reply = bus
        .request(
            "config.get",
            json!({"key": "tick"}),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"value": 50}));
    bus.stop();
}

#[tokio::test(start_paused = true)]
async fn request_times_out_without_subscriber() {
    let bus = MessageBus::default();
    bus.start();

    let started = Instant::now();
    let err = bus
        .request("ping", json!({}), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        Error::Delivery(DeliveryError::RequestTimeout { .. })
    ));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150));
    bus.stop();
}

#[tokio::test]
async fn round_robin_distributes_evenly() {
    let bus = MessageBus::default();
    bus.create_exchange("workers", RoutingStrategy::RoundRobin)
        .await
        .unwrap();
    bus.create_queue("w1", QueueOptions::default()).await.unwrap();
    bus.create_queue("w2", QueueOptions::default()).await.unwrap();
    bus.bind_queue("w1", "workers", "jobs.encode").await.unwrap();
    bus.bind_queue("w2", "workers", "jobs.encode").await.unwrap();

    for _ in 0..4 {
        let receipt = bus
            .publish(
                "jobs.encode",
                Value::Null,
                PublishOptions {
                    exchange: Some("workers".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.destinations.len(), 1);
    }

    let depths: Vec<usize> = bus.queue_stats().await.iter().map(|s| s.depth).collect();
    assert_eq!(depths, vec![2, 2]);
}

#[tokio::test]
async fn filtered_messages_are_consumed_not_redelivered() {
    let bus = MessageBus::new(fast_config());
    bus.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        "logs.#",
        recording_handler(tx),
        SubscribeOptions {
            filter: Some(MessageFilter::Fields(HashMap::from([(
                "level".to_string(),
                json!("high"),
            )]))),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    bus.publish("logs.app", json!({"level": "low"}), PublishOptions::default())
        .await
        .unwrap();
    bus.publish("logs.app", json!({"level": "high"}), PublishOptions::default())
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(received.payload["level"], json!("high"));

    // The filtered-out message was acknowledged, not retried or dead-lettered
    eventually(|| async {
        let stats = &bus.queue_stats().await[0];
        stats.depth == 0 && stats.in_flight == 0 && stats.dead_letters == 0
    })
    .await;
    assert_eq!(bus.status().await.delivered, 1);
    bus.stop();
}

#[tokio::test]
async fn paused_subscription_holds_work_until_resume() {
    let bus = MessageBus::new(fast_config());
    bus.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = bus
        .subscribe("queued.work", recording_handler(tx), SubscribeOptions::default())
        .await
        .unwrap();

    bus.pause_subscription(&id).await;
    bus.publish("queued.work", Value::Null, PublishOptions::default())
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(bus.queue_stats().await[0].depth, 1);

    bus.resume_subscription(&id).await;
    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out after resume");
    assert!(received.is_some());
    bus.stop();
}

#[tokio::test]
async fn delivery_follows_priority_order() {
    let bus = MessageBus::new(fast_config());

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        "ranked.#",
        recording_handler(tx),
        SubscribeOptions {
            // One in-flight invocation at a time keeps delivery strictly ordered
            max_concurrent: Some(1),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    for priority in [9u8, 1, 5] {
        bus.publish(
            "ranked.item",
            json!({"p": priority}),
            PublishOptions {
                priority: Some(priority),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    // Everything was queued before the first tick
    bus.start();

    let mut order = Vec::new();
    for _ in 0..3 {
        let received = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .unwrap();
        order.push(received.priority);
    }
    assert_eq!(order, vec![1, 5, 9]);
    bus.stop();
}

#[tokio::test]
async fn exactly_once_reports_duplicate_to_publisher() {
    let mut config = fast_config();
    config.delivery.policy = DeliveryPolicy::ExactlyOnce;
    let bus = MessageBus::new(config);
    bus.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe("sensor.#", recording_handler(tx), SubscribeOptions::default())
        .await
        .unwrap();

    let first = bus
        .publish("sensor.read", json!({"celsius": 21}), PublishOptions::default())
        .await
        .unwrap();
    let second = bus
        .publish("sensor.read", json!({"celsius": 21}), PublishOptions::default())
        .await
        .unwrap();

    assert!(first.routed && !first.duplicate);
    assert!(second.duplicate && !second.routed);

    // Exactly one delivery comes out the other end
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(bus.status().await.delivered, 1);
    bus.stop();
}

#[tokio::test]
async fn unsubscribe_stops_future_dispatch() {
    let bus = MessageBus::new(fast_config());
    bus.start();
    let mut signals = bus.subscribe_signals();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = bus
        .subscribe("gone.soon", recording_handler(tx), SubscribeOptions::default())
        .await
        .unwrap();
    assert!(bus.unsubscribe(&id).await);

    // The removal signal is observable
    loop {
        let signal = timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("timed out")
            .unwrap();
        if let BusSignal::SubscriptionRemoved { subscription_id } = signal.as_ref() {
            assert_eq!(subscription_id, &id);
            break;
        }
    }

    // Publishing afterwards reaches nobody
    let receipt = bus
        .publish("gone.soon", Value::Null, PublishOptions::default())
        .await
        .unwrap();
    assert!(!receipt.routed);
    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    bus.stop();
}
