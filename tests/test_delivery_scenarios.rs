//! End-to-end delivery handling: handler outcomes become broker acks,
//! requeues and discards, and nothing is lost when a session dies.


use std::sync::Arc;
use std::time::Duration;
use test_helpers::{session_for, test_config, test_config_with, wait_until};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warren::config::Config;
use warren::dispatch::{HandlerOutcome, MessageHandler};
use warren::observability::metrics::ConsumerMetrics;
use warren::testing::{BrokerEvent, MockBroker, ScriptedHandler, Step};
use warren::{Session, SessionError};

const QUEUE: &str = "orders";

struct Running {
    broker: MockBroker,
    shutdown: watch::Sender<bool>,
    metrics: Arc<ConsumerMetrics>,
    consumer: JoinHandle<(Session, Result<(), SessionError>)>,
}

impl Running {
    async fn finish(self) -> (Session, Result<(), SessionError>) {
        self.shutdown.send_replace(true);
        self.consumer.await.unwrap()
    }
}

async fn consume_with(
    broker: &MockBroker,
    config: Config,
    handler: Option<Arc<ScriptedHandler>>,
    auto_ack: bool,
) -> Running {
    let handler = handler.map(|h| {
        let handler: Arc<dyn MessageHandler> = h;
        handler
    });
    let (mut session, shutdown, metrics) = session_for(broker, config, handler);
    assert!(session.connect().await);

    let consumer = tokio::spawn(async move {
        let result = session.start_consuming(QUEUE, auto_ack).await;
        (session, result)
    });
    assert!(wait_until(Duration::from_secs(2), || broker.consumer_count() == 1).await);

    Running {
        broker: broker.clone(),
        shutdown,
        metrics,
        consumer,
    }
}

#[tokio::test]
async fn test_accepted_message_is_acked() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::always(HandlerOutcome::Accept));
    let running = consume_with(&broker, test_config(), Some(handler.clone()), false).await;

    broker.publish(QUEUE, r#"{"order_id": 7}"#);
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 1).await);

    assert_eq!(handler.calls(), vec![serde_json::json!({"order_id": 7})]);
    let snapshot = running.metrics.snapshot();
    assert_eq!(snapshot.messages_received, 1);
    assert_eq!(snapshot.messages_processed, 1);
    assert_eq!(snapshot.messages_failed, 0);

    let (_, result) = running.finish().await;
    assert!(result.is_ok());
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_retry_requeues_then_succeeds() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::new([Step::Return(HandlerOutcome::Retry)]));
    let running = consume_with(&broker, test_config(), Some(handler.clone()), false).await;

    broker.publish(QUEUE, r#"{"n": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 1).await);

    let events = broker.events();
    assert!(matches!(events[1], BrokerEvent::Rejected { tag: 1, requeue: true }));
    assert!(matches!(events[3], BrokerEvent::Acked { tag: 2 }));
    assert_eq!(handler.call_count(), 2);

    let snapshot = running.metrics.snapshot();
    assert_eq!(snapshot.messages_received, 2);
    assert_eq!(snapshot.messages_retried, 1);
    assert_eq!(snapshot.messages_processed, 1);
    assert_eq!(snapshot.messages_failed, 0);
    assert_eq!(broker.ready_count(QUEUE), 0);

    running.finish().await;
}

#[tokio::test]
async fn test_handler_fault_requeues() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::new([Step::Fault("db timeout".into())]));
    let running = consume_with(&broker, test_config(), Some(handler.clone()), false).await;

    broker.publish(QUEUE, r#"{"n": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 1).await);

    assert!(broker
        .events()
        .contains(&BrokerEvent::Rejected { tag: 1, requeue: true }));
    let snapshot = running.metrics.snapshot();
    assert_eq!(snapshot.messages_retried, 1);
    assert_eq!(snapshot.messages_failed, 0);

    running.finish().await;
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::new([Step::Panic("handler bug".into())]));
    let running = consume_with(&broker, test_config(), Some(handler.clone()), false).await;

    broker.publish(QUEUE, r#"{"n": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 1).await);

    // the panic requeued the message and the same consumer kept going
    assert!(broker
        .events()
        .contains(&BrokerEvent::Rejected { tag: 1, requeue: true }));
    assert_eq!(handler.call_count(), 2);
    assert_eq!(broker.connects(), 1);

    let snapshot = running.metrics.snapshot();
    assert_eq!(snapshot.messages_failed, 0);
    assert_eq!(snapshot.messages_retried, 1);
    assert_eq!(snapshot.messages_processed, 1);

    let (_, result) = running.finish().await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_undecodable_message_is_discarded() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::always(HandlerOutcome::Accept));
    let running = consume_with(&broker, test_config(), Some(handler.clone()), false).await;

    broker.publish(QUEUE, "definitely not json");
    broker.publish(QUEUE, r#"{"ok": true}"#);
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 1).await);

    assert!(broker
        .events()
        .contains(&BrokerEvent::Rejected { tag: 1, requeue: false }));
    assert_eq!(handler.call_count(), 1);
    assert_eq!(broker.ready_count(QUEUE), 0);

    let snapshot = running.metrics.snapshot();
    assert_eq!(snapshot.messages_failed, 1);
    assert_eq!(snapshot.messages_processed, 1);

    running.finish().await;
}

#[tokio::test]
async fn test_rejected_message_is_not_requeued() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::always(HandlerOutcome::Reject));
    let running = consume_with(&broker, test_config(), Some(handler.clone()), false).await;

    broker.publish(QUEUE, r#"{"order_id": "bad"}"#);
    assert!(
        wait_until(Duration::from_secs(2), || !broker.events().is_empty()
            && broker.unacked_count() == 0)
        .await
    );

    assert_eq!(
        broker.events()[1],
        BrokerEvent::Rejected {
            tag: 1,
            requeue: false
        }
    );
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(running.metrics.snapshot().messages_failed, 1);

    running.finish().await;
}

#[tokio::test]
async fn test_prefetch_one_serializes_deliveries() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::new([
        Step::Delay(Duration::from_millis(50), HandlerOutcome::Accept),
        Step::Delay(Duration::from_millis(50), HandlerOutcome::Accept),
    ]));
    broker.publish(QUEUE, r#"{"n": 1}"#);
    broker.publish(QUEUE, r#"{"n": 2}"#);

    let config = test_config_with("[listener]\nprefetch_count = 1\n");
    let running = consume_with(&broker, config, Some(handler), false).await;
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 2).await);

    assert_eq!(
        broker.events(),
        vec![
            BrokerEvent::Delivered {
                tag: 1,
                body: r#"{"n": 1}"#.into()
            },
            BrokerEvent::Acked { tag: 1 },
            BrokerEvent::Delivered {
                tag: 2,
                body: r#"{"n": 2}"#.into()
            },
            BrokerEvent::Acked { tag: 2 },
        ]
    );

    running.finish().await;
}

#[tokio::test]
async fn test_no_handler_acknowledges() {
    let broker = MockBroker::new();
    let running = consume_with(&broker, test_config(), None, false).await;

    broker.publish(QUEUE, r#"{"type": "ping"}"#);
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 1).await);
    assert_eq!(running.metrics.snapshot().messages_processed, 1);

    running.finish().await;
}

#[tokio::test]
async fn test_auto_ack_sends_no_settlement() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::always(HandlerOutcome::Reject));
    let running = consume_with(&broker, test_config(), Some(handler.clone()), true).await;

    broker.publish(QUEUE, r#"{"n": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || handler.call_count() == 1).await);

    let (_, result) = running.finish().await;
    assert!(result.is_ok());
    assert!(broker
        .events()
        .iter()
        .all(|e| matches!(e, BrokerEvent::Delivered { .. })));
}

#[tokio::test]
async fn test_in_flight_message_survives_broker_loss() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::new([Step::Delay(
        Duration::from_millis(200),
        HandlerOutcome::Accept,
    )]));
    let running = consume_with(&broker, test_config(), Some(handler.clone()), false).await;

    broker.publish(QUEUE, r#"{"n": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || handler.call_count() == 1).await);
    broker.sever_connections();

    let (_, result) = running.consumer.await.unwrap();
    assert!(result.is_err());
    assert_eq!(broker.acked_count(), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count(QUEUE), 1);
}
