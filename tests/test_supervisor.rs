//! Supervisor restart loop against the in-memory broker


use std::sync::Arc;
use std::time::{Duration, Instant};
use test_helpers::{test_config, test_config_with, wait_until};
use warren::dispatch::HandlerOutcome;
use warren::testing::{ConnectFault, MockBroker, ScriptedHandler, Step};
use warren::{Supervisor, SupervisorStatus};

const QUEUE: &str = "orders";

fn supervisor(broker: &MockBroker, config: warren::Config) -> Supervisor {
    Supervisor::new(config, Arc::new(broker.clone()))
}

#[tokio::test]
async fn test_start_consume_and_stop() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::always(HandlerOutcome::Accept));
    let mut supervisor = supervisor(&broker, test_config()).with_handler(handler.clone());

    assert!(!supervisor.is_running());
    assert!(supervisor.start(QUEUE));
    assert!(supervisor.is_running());
    assert!(!supervisor.start(QUEUE), "second start is refused");

    assert!(wait_until(Duration::from_secs(2), || broker.consumer_count() == 1).await);
    broker.publish(QUEUE, r#"{"order_id": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 1).await);

    let started = Instant::now();
    supervisor.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!supervisor.is_running());
    assert_eq!(broker.consumer_count(), 0);
    assert_eq!(supervisor.status(), SupervisorStatus::NotConnected);
    assert_eq!(supervisor.metrics().snapshot().messages_processed, 1);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_handler() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::new([Step::Delay(
        Duration::from_millis(200),
        HandlerOutcome::Accept,
    )]));
    let mut supervisor = supervisor(&broker, test_config()).with_handler(handler.clone());
    supervisor.start(QUEUE);

    assert!(wait_until(Duration::from_secs(2), || broker.consumer_count() == 1).await);
    broker.publish(QUEUE, r#"{"n": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || handler.call_count() == 1).await);

    supervisor.stop().await;
    assert_eq!(broker.acked_count(), 1);
    assert_eq!(broker.ready_count(QUEUE), 0);
}

#[tokio::test]
async fn test_stop_is_bounded_by_timeout() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::new([Step::Delay(
        Duration::from_secs(30),
        HandlerOutcome::Accept,
    )]));
    let config = test_config_with("[supervisor]\nstop_timeout = 1\n");
    let mut supervisor = supervisor(&broker, config).with_handler(handler.clone());
    supervisor.start(QUEUE);

    assert!(wait_until(Duration::from_secs(2), || broker.consumer_count() == 1).await);
    broker.publish(QUEUE, r#"{"n": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || handler.call_count() == 1).await);

    let started = Instant::now();
    supervisor.stop().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900));
    assert!(elapsed < Duration::from_secs(3));
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn test_aborted_stop_releases_session() {
    let broker = MockBroker::new();
    let handler = Arc::new(ScriptedHandler::new([Step::Delay(
        Duration::from_secs(30),
        HandlerOutcome::Accept,
    )]));
    let config = test_config_with("[supervisor]\nstop_timeout = 1\n");
    let mut supervisor = supervisor(&broker, config).with_handler(handler.clone());
    supervisor.start(QUEUE);

    assert!(wait_until(Duration::from_secs(2), || broker.consumer_count() == 1).await);
    broker.publish(QUEUE, r#"{"n": 1}"#);
    assert!(wait_until(Duration::from_secs(2), || handler.call_count() == 1).await);

    supervisor.stop().await;

    assert!(!supervisor.is_running());
    assert_eq!(supervisor.status(), SupervisorStatus::NotConnected);
    let snapshot = supervisor.metrics().snapshot();
    assert!(!snapshot.connected);
    assert_eq!(snapshot.active_consumers, 0);

    // the abandoned delivery went back to the queue
    assert_eq!(broker.consumer_count(), 0);
    assert_eq!(broker.open_channel_count(), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count(QUEUE), 1);
}

#[tokio::test]
async fn test_stop_interrupts_slow_connect() {
    let broker = MockBroker::new();
    broker.delay_connects(Duration::from_secs(30));
    let config = test_config_with("[supervisor]\nstop_timeout = 3\n");
    let mut supervisor = supervisor(&broker, config);
    supervisor.start(QUEUE);

    // the slot is now parked inside connect
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    supervisor.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!supervisor.is_running());

    let snapshot = supervisor.metrics().snapshot();
    assert_eq!(snapshot.connection_errors, 0);
    assert_eq!(snapshot.connections, 0);
    assert_eq!(broker.open_channel_count(), 0);
}

#[tokio::test]
async fn test_recovers_after_failed_connects() {
    let broker = MockBroker::new();
    broker.fail_next_connects(3, ConnectFault::Refused);
    let mut supervisor = supervisor(&broker, test_config());
    supervisor.start(QUEUE);

    assert!(wait_until(Duration::from_secs(2), || broker.consumer_count() == 1).await);
    assert_eq!(broker.connects(), 4);

    let snapshot = supervisor.metrics().snapshot();
    assert_eq!(snapshot.connection_errors, 3);
    assert_eq!(snapshot.connections, 1);
    assert_eq!(snapshot.reconnects, 0);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_reconnects_after_broker_loss() {
    let broker = MockBroker::new();
    let mut supervisor = supervisor(&broker, test_config());
    supervisor.start(QUEUE);
    assert!(wait_until(Duration::from_secs(2), || broker.consumer_count() == 1).await);

    broker.sever_connections();
    assert!(
        wait_until(Duration::from_secs(2), || {
            supervisor.metrics().snapshot().reconnects == 1 && broker.consumer_count() == 1
        })
        .await
    );
    assert_eq!(broker.connects(), 2);

    broker.publish(QUEUE, r#"{"after": "restart"}"#);
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 1).await);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_status_reflects_connection() {
    let broker = MockBroker::new();
    broker.fail_next_connects(1, ConnectFault::Tls);
    let mut supervisor = supervisor(
        &broker,
        test_config_with("[supervisor]\nrestart_delay = 1\nmax_restart_delay = 1\n"),
    );
    assert_eq!(supervisor.status(), SupervisorStatus::NotConnected);

    supervisor.start(QUEUE);
    assert!(wait_until(Duration::from_millis(500), || broker.connects() == 1).await);

    // counters stay visible while the slot backs off
    let SupervisorStatus::Active(snapshot) = supervisor.status() else {
        panic!("a running supervisor reports its counters");
    };
    assert!(!snapshot.connected);
    assert_eq!(snapshot.connection_errors, 1);

    assert!(
        wait_until(Duration::from_secs(3), || matches!(
            supervisor.status(),
            SupervisorStatus::Active(snapshot) if snapshot.connected
        ))
        .await
    );
    let SupervisorStatus::Active(snapshot) = supervisor.status() else {
        panic!("expected an active status");
    };
    assert!(snapshot.connected);
    assert_eq!(snapshot.connection_errors, 1);

    supervisor.stop().await;
    assert_eq!(supervisor.status(), SupervisorStatus::NotConnected);
}

#[tokio::test]
async fn test_concurrency_runs_one_consumer_per_slot() {
    let broker = MockBroker::new();
    let config = test_config_with("[listener]\nconcurrency = 3\n");
    let mut supervisor = supervisor(&broker, config);
    supervisor.start(QUEUE);

    assert!(wait_until(Duration::from_secs(2), || broker.consumer_count() == 3).await);
    assert_eq!(supervisor.metrics().snapshot().active_consumers, 3);

    for n in 0..6 {
        broker.publish(QUEUE, format!(r#"{{"n": {n}}}"#));
    }
    assert!(wait_until(Duration::from_secs(2), || broker.acked_count() == 6).await);

    supervisor.stop().await;
    assert_eq!(broker.consumer_count(), 0);
}
