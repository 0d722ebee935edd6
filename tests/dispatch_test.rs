// Delivery dispatch through a connected consumer

mod common;

use common::{connect, next_event, wait_until, Recorder};
use serde_json::json;
use sneaker::messaging::{
    ConnectionState, ConsumeOverrides, Consumer, ConsumerEvent, InMemoryBroker, MessagingError,
    Publisher,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn publish_all(consumer: &Consumer, queue: &str, bodies: &[String]) {
    for body in bodies {
        consumer.publish(queue, None, body.as_bytes()).await.unwrap();
    }
}

fn bodies(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}-{}", prefix, i)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_worker_auto_ack_preserves_order() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;

    let recorder = Recorder::new();
    consumer
        .consume(
            "ordered",
            ConsumeOverrides::new().threads(1).auto_ack(true),
            recorder.handler(),
        )
        .await
        .unwrap();

    let sent = bodies("msg", 3);
    publish_all(&consumer, "ordered", &sent).await;
    wait_until("three deliveries", || recorder.count() == 3).await;

    assert_eq!(recorder.payloads(), sent);
    // the broker settled them on send
    assert_eq!(broker.ack_count(), 0);
    assert_eq!(broker.unacked_count(), 0);

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_acks_every_delivery() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;

    let recorder = Recorder::new();
    consumer
        .consume("pool", ConsumeOverrides::new().threads(4), recorder.handler())
        .await
        .unwrap();

    let sent = bodies("job", 20);
    publish_all(&consumer, "pool", &sent).await;
    wait_until("all deliveries acked", || broker.ack_count() == 20).await;

    let mut seen = recorder.payloads();
    seen.sort();
    let mut expected = sent.clone();
    expected.sort();
    assert_eq!(seen, expected);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("pool"), 0);

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_handle_deliveries_concurrently() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let (a, p, d) = (active.clone(), peak.clone(), done.clone());
    consumer
        .consume(
            "slow",
            ConsumeOverrides::new().threads(3),
            move |_: &[u8]| -> anyhow::Result<()> {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                a.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await
        .unwrap();

    publish_all(&consumer, "slow", &bodies("slow", 6)).await;
    wait_until("six deliveries", || done.load(Ordering::SeqCst) == 6).await;

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak > 1, "expected overlapping handlers, peak was {}", peak);
    assert!(peak <= 3);

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_handler_leaves_delivery_unacked() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;
    let mut events = consumer.events();

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    consumer
        .consume(
            "flaky",
            ConsumeOverrides::new().threads(1),
            move |payload: &[u8]| -> anyhow::Result<()> {
                match payload {
                    b"error" => anyhow::bail!("cannot process"),
                    b"panic" => panic!("handler crashed"),
                    _ => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            },
        )
        .await
        .unwrap();

    let sent = vec!["error".to_string(), "panic".to_string(), "fine".to_string()];
    publish_all(&consumer, "flaky", &sent).await;

    let first = next_event(&mut events, |e| matches!(e, ConsumerEvent::HandlerFailed { .. })).await;
    assert_eq!(first.queue(), Some("flaky"));
    let second =
        next_event(&mut events, |e| matches!(e, ConsumerEvent::HandlerFailed { .. })).await;
    assert!(matches!(
        second,
        ConsumerEvent::HandlerFailed { ref error, .. } if error.contains("handler crashed")
    ));

    // the worker survives both failures
    wait_until("healthy delivery acked", || broker.ack_count() == 1).await;
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(broker.unacked_count(), 2);

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_ack_failure_is_not_redelivered() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;
    let mut events = consumer.events();

    consumer
        .consume(
            "fire-and-forget",
            ConsumeOverrides::new().auto_ack(true),
            |_: &[u8]| -> anyhow::Result<()> { anyhow::bail!("always fails") },
        )
        .await
        .unwrap();

    publish_all(&consumer, "fire-and-forget", &bodies("lost", 1)).await;
    next_event(&mut events, |e| matches!(e, ConsumerEvent::HandlerFailed { .. })).await;

    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("fire-and-forget"), 0);

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reregistering_replaces_handler() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;

    let first = Recorder::new();
    let second = Recorder::new();
    consumer
        .consume("swap", ConsumeOverrides::new().threads(2), first.handler())
        .await
        .unwrap();
    consumer
        .consume("swap", ConsumeOverrides::new().threads(1), second.handler())
        .await
        .unwrap();

    assert_eq!(consumer.subscriptions(), vec!["swap"]);
    assert_eq!(consumer.options("swap").unwrap().threads, 1);

    let sent = bodies("swap", 5);
    publish_all(&consumer, "swap", &sent).await;
    wait_until("second handler saw everything", || second.count() == 5).await;

    assert_eq!(first.count(), 0);
    assert_eq!(second.payloads(), sent);
    wait_until("old consumer cancelled", || broker.consumer_count("swap") == 1).await;

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reregistering_cancels_old_consumer_while_handler_busy() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;

    let (release, gate) = std::sync::mpsc::channel::<()>();
    let gate = Arc::new(parking_lot::Mutex::new(gate));
    let started = Arc::new(AtomicUsize::new(0));
    let entered = started.clone();
    consumer
        .consume(
            "swap",
            ConsumeOverrides::new().threads(1),
            move |_: &[u8]| -> anyhow::Result<()> {
                entered.fetch_add(1, Ordering::SeqCst);
                gate.lock().recv()?;
                Ok(())
            },
        )
        .await
        .unwrap();
    publish_all(&consumer, "swap", &bodies("held", 1)).await;
    wait_until("first handler busy", || started.load(Ordering::SeqCst) == 1).await;

    let second = Recorder::new();
    consumer
        .consume("swap", ConsumeOverrides::new().threads(1), second.handler())
        .await
        .unwrap();
    // the old broker-side consumer goes away before its handler returns
    wait_until("old consumer cancelled", || broker.consumer_count("swap") == 1).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    let sent = bodies("new", 3);
    publish_all(&consumer, "swap", &sent).await;
    wait_until("second handler saw everything", || second.count() == 3).await;
    assert_eq!(second.payloads(), sent);
    assert_eq!(started.load(Ordering::SeqCst), 1);

    // the in-flight delivery is still acknowledged on its own channel
    release.send(()).unwrap();
    wait_until("every delivery acked", || broker.ack_count() == 4).await;
    assert_eq!(broker.unacked_count(), 0);
    wait_until("old channel closed", || broker.open_channels() == 2).await;

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_declare_leaves_other_subscriptions_running() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;
    let mut events = consumer.events();

    let jobs = Recorder::new();
    let mail = Recorder::new();
    consumer
        .consume("jobs", ConsumeOverrides::new(), jobs.handler())
        .await
        .unwrap();
    consumer
        .consume("mail", ConsumeOverrides::new(), mail.handler())
        .await
        .unwrap();

    // redeclaring "jobs" as transient is a channel error on the broker
    let result = consumer
        .consume("jobs", ConsumeOverrides::new().durable(false), Recorder::new().handler())
        .await;
    match result {
        Err(MessagingError::Declare(message)) => assert!(message.contains("PRECONDITION_FAILED")),
        other => panic!("expected declare error, got {:?}", other.err()),
    }

    assert_eq!(consumer.state(), ConnectionState::Connected);
    assert_eq!(consumer.subscriptions(), vec!["jobs", "mail"]);
    assert!(consumer.options("jobs").unwrap().durable);

    consumer.publish("jobs", None, b"j").await.unwrap();
    consumer.publish("mail", None, b"m").await.unwrap();
    wait_until("jobs delivery", || jobs.count() == 1).await;
    wait_until("mail delivery", || mail.count() == 1).await;
    assert_eq!(broker.ack_count(), 2);

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, ConsumerEvent::ConnectionLost { .. }), "{:?}", event);
    }
    assert_eq!(broker.dial_count(), 1);

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_option_map_declares_nothing() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;

    let wrong_type = json!({ "durable": "yes" });
    let result = consumer
        .consume_with_map("typed", wrong_type.as_object().unwrap(), Recorder::new().handler())
        .await;
    match result {
        Err(MessagingError::Config(message)) => assert!(message.contains("durable")),
        other => panic!("expected config error, got {:?}", other.err()),
    }

    let unknown = json!({ "prefetch": 10 });
    let result = consumer
        .consume_with_map("typed", unknown.as_object().unwrap(), Recorder::new().handler())
        .await;
    assert!(matches!(result, Err(MessagingError::Config(_))));

    let zero = consumer
        .consume("typed", ConsumeOverrides::new().threads(0), Recorder::new().handler())
        .await;
    assert!(matches!(zero, Err(MessagingError::Config(_))));

    assert!(!broker.queue_exists("typed"));
    assert!(consumer.subscriptions().is_empty());

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_option_map_overrides_defaults() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;

    let overrides = json!({ "autoAck": true, "threads": 2, "consumer": "mapped" });
    let recorder = Recorder::new();
    consumer
        .consume_with_map("mapped", overrides.as_object().unwrap(), recorder.handler())
        .await
        .unwrap();

    let options = consumer.options("mapped").unwrap();
    assert!(options.auto_ack);
    assert!(options.durable);
    assert_eq!(options.threads, 2);
    assert_eq!(options.consumer, "mapped");

    publish_all(&consumer, "mapped", &bodies("m", 2)).await;
    wait_until("mapped deliveries", || recorder.count() == 2).await;

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_standalone_publisher_reaches_consumer() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;

    let recorder = Recorder::new();
    consumer
        .consume("inbox", ConsumeOverrides::new(), recorder.handler())
        .await
        .unwrap();

    let publisher = Publisher::connect("memory://test", consumer.exchange(), &broker)
        .await
        .unwrap();
    publisher
        .publish("inbox", Some("application/json"), br#"{"id":1}"#)
        .await
        .unwrap();
    // nothing is bound under this key; the message is dropped
    publisher.publish("nowhere", None, b"void").await.unwrap();

    wait_until("publisher delivery", || recorder.count() == 1).await;
    assert_eq!(recorder.payloads(), vec![r#"{"id":1}"#]);
    assert_eq!(broker.published_count(), 2);

    publisher.close().await.unwrap();
    let closed = publisher.publish("inbox", None, b"late").await;
    assert!(matches!(closed, Err(MessagingError::Publish(_))));

    consumer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_outlives_consumer_shutdown() {
    let broker = InMemoryBroker::new();
    let consumer = connect(&broker).await;
    let recorder = Recorder::new();
    consumer
        .consume("jobs", ConsumeOverrides::new(), recorder.handler())
        .await
        .unwrap();

    let publisher = Publisher::connect("memory://test", consumer.exchange(), &broker)
        .await
        .unwrap();
    consumer.shutdown().await;

    // messages published after shutdown stay queued for the next consumer
    publisher.publish("jobs", None, b"queued").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(broker.queue_depth("jobs"), 1);

    publisher.close().await.unwrap();
}
