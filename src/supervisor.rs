//! Restart-on-failure control loop
//!
//! The supervisor runs one task per worker slot. Each slot owns at most one
//! [`Session`] at a time and keeps replacing it for as long as the
//! supervisor is running: connect failures back off exponentially up to a
//! ceiling, dropped or faulted sessions wait `fault_delay`. Nothing a session
//! does can end a slot except shutdown.

use crate::config::{Config, ListenerSection};
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::observability::metrics::{ConsumerMetrics, MetricsSnapshot};
use crate::session::Session;
use crate::session_span;
use crate::transport::Connector;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// How long `stop()` waits for an aborted slot to hand over its session
const SESSION_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Live status exposed to the embedding process
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorStatus {
    /// Never started, or stopped
    NotConnected,
    /// Running; `connected` in the snapshot is false while reconnecting
    Active(MetricsSnapshot),
}

/// The session a worker slot currently owns, reachable from `stop()`
type SessionCell = Arc<Mutex<Option<Session>>>;

/// Delay before the next connect after `failures` consecutive failures:
/// `min(base * 2^(failures-1), max)`
pub fn restart_backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max)
}

/// Worker slots to run, clamped to `1..=max_concurrency`
pub fn effective_concurrency(listener: &ListenerSection) -> u16 {
    let slots = listener.concurrency.min(listener.max_concurrency).max(1);
    if slots != listener.concurrency {
        warn!(
            requested = listener.concurrency,
            max = listener.max_concurrency,
            using = slots,
            "Concurrency clamped"
        );
    }
    slots
}

/// How one session iteration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Iteration {
    ConnectFailed,
    /// Connected, then lost the session to a broker or channel error
    Dropped,
    Shutdown,
}

/// Shared by every worker slot
struct SlotContext {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    handler: Option<Arc<dyn MessageHandler>>,
    metrics: Arc<ConsumerMetrics>,
    running: Arc<AtomicBool>,
    queue: String,
}

/// Owns the worker slots and their sessions
pub struct Supervisor {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    handler: Option<Arc<dyn MessageHandler>>,
    metrics: Arc<ConsumerMetrics>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    sessions: Vec<SessionCell>,
}

impl Supervisor {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            connector,
            handler: None,
            metrics: Arc::new(ConsumerMetrics::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            workers: Vec::new(),
            sessions: Vec::new(),
        }
    }

    /// Attach the business handler; without one every decodable message is acked
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn set_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Counters shared by every session this supervisor runs
    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Receiver that flips to `true` when `stop()` begins
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SupervisorStatus {
        if self.is_running() {
            SupervisorStatus::Active(self.metrics.snapshot())
        } else {
            SupervisorStatus::NotConnected
        }
    }

    /// Spawn the worker slots consuming `queue`. Returns false if already running.
    pub fn start(&mut self, queue: &str) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Supervisor already running");
            return false;
        }
        self.shutdown_tx.send_replace(false);

        let slots = effective_concurrency(&self.config.listener);
        let context = Arc::new(SlotContext {
            config: self.config.clone(),
            connector: self.connector.clone(),
            handler: self.handler.clone(),
            metrics: self.metrics.clone(),
            running: self.running.clone(),
            queue: queue.to_string(),
        });

        info!(
            queue,
            slots,
            endpoint = %self.config.display_endpoint(),
            "Starting consumer supervisor"
        );
        self.sessions = (0..slots).map(|_| SessionCell::default()).collect();
        self.workers = self
            .sessions
            .iter()
            .zip(0..slots)
            .map(|(cell, slot)| {
                tokio::spawn(run_slot(
                    context.clone(),
                    slot,
                    cell.clone(),
                    self.shutdown_tx.subscribe(),
                ))
            })
            .collect();
        true
    }

    /// Signal shutdown and wait, bounded by `supervisor.stop_timeout`, for
    /// every slot to exit. Slots still running at the deadline are aborted
    /// and the sessions they held are closed here.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);

        let workers = std::mem::take(&mut self.workers);
        if workers.is_empty() {
            return;
        }
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let timeout = Duration::from_secs(self.config.supervisor.stop_timeout);

        match tokio::time::timeout(timeout, futures_util::future::join_all(workers)).await {
            Ok(_) => info!("Supervisor stopped"),
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Workers did not stop in time, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
                self.close_abandoned_sessions().await;
            }
        }
        self.sessions.clear();
    }

    /// Close whatever sessions aborted slots left behind. The cell lock is
    /// released when an aborted task's future is dropped.
    async fn close_abandoned_sessions(&self) {
        for (slot, cell) in self.sessions.iter().enumerate() {
            let Ok(mut held) = tokio::time::timeout(SESSION_RELEASE_TIMEOUT, cell.lock()).await else {
                error!(slot, "Aborted slot did not release its session");
                continue;
            };
            if let Some(mut session) = held.take() {
                warn!(slot, session = %session.id(), state = %session.state(), "Closing session left by aborted slot");
                session.close().await;
            }
        }
        self.metrics.clear_session_gauges();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }
}

/// Sleep for `delay` unless shutdown arrives first. Returns false on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    let slept = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait_for(|stop| *stop) => false,
    };
    slept && !*shutdown.borrow()
}

async fn run_slot(
    context: Arc<SlotContext>,
    slot: u16,
    cell: SessionCell,
    mut shutdown: watch::Receiver<bool>,
) {
    let timing = &context.config.supervisor;
    let base = Duration::from_secs(timing.restart_delay);
    let ceiling = Duration::from_secs(timing.max_restart_delay);
    let fault_delay = Duration::from_secs(timing.fault_delay);

    let mut failures = 0u32;
    let mut connected_before = false;

    while context.running.load(Ordering::SeqCst) {
        let mut held = cell.lock().await;
        let session = held.insert(Session::new(
            context.config.clone(),
            context.connector.clone(),
            Dispatcher::new(context.metrics.clone()),
            shutdown.clone(),
        ));
        if let Some(handler) = &context.handler {
            session.set_handler(handler.clone());
        }

        let span = session_span!(slot, session = %session.id());
        let outcome = AssertUnwindSafe(run_iteration(
            session,
            &context.queue,
            &context.metrics,
            &shutdown,
            connected_before,
        ))
        .catch_unwind()
        .instrument(span)
        .await;
        session.close().await;
        *held = None;
        drop(held);

        let delay = match outcome {
            Ok(Iteration::Shutdown) => break,
            Ok(Iteration::ConnectFailed) => {
                failures = failures.saturating_add(1);
                let delay = restart_backoff(base, ceiling, failures);
                warn!(slot, failures, delay_secs = delay.as_secs(), "Connect failed, backing off");
                delay
            }
            Ok(Iteration::Dropped) => {
                failures = 0;
                connected_before = true;
                warn!(slot, delay_secs = fault_delay.as_secs(), "Session dropped, restarting");
                fault_delay
            }
            Err(_) => {
                error!(slot, delay_secs = fault_delay.as_secs(), "Session iteration panicked, restarting");
                fault_delay
            }
        };

        if !pause(delay, &mut shutdown).await {
            break;
        }
    }
    info!(slot, "Worker slot exited");
}

async fn run_iteration(
    session: &mut Session,
    queue: &str,
    metrics: &ConsumerMetrics,
    shutdown: &watch::Receiver<bool>,
    connected_before: bool,
) -> Iteration {
    if !session.connect().await {
        if *shutdown.borrow() {
            return Iteration::Shutdown;
        }
        return Iteration::ConnectFailed;
    }
    if connected_before {
        metrics.reconnected();
    }
    match session.start_consuming(queue, false).await {
        Ok(()) => Iteration::Shutdown,
        Err(_) => Iteration::Dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(60);
        assert_eq!(restart_backoff(base, max, 1), Duration::from_secs(10));
        assert_eq!(restart_backoff(base, max, 2), Duration::from_secs(20));
        assert_eq!(restart_backoff(base, max, 3), Duration::from_secs(40));
        assert_eq!(restart_backoff(base, max, 4), Duration::from_secs(60));
        assert_eq!(restart_backoff(base, max, 1_000), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_zero_failures_uses_base() {
        let base = Duration::from_millis(5);
        assert_eq!(restart_backoff(base, Duration::from_secs(1), 0), base);
    }

    #[test]
    fn test_concurrency_clamped() {
        let mut listener = ListenerSection::default();
        listener.concurrency = 4;
        assert_eq!(effective_concurrency(&listener), 4);

        listener.concurrency = 50;
        listener.max_concurrency = 10;
        assert_eq!(effective_concurrency(&listener), 10);

        listener.concurrency = 0;
        assert_eq!(effective_concurrency(&listener), 1);
    }

    #[tokio::test]
    async fn test_status_follows_running_flag() {
        let supervisor = Supervisor::new(
            crate::config::test_config(),
            Arc::new(crate::testing::MockBroker::new()),
        );
        assert_eq!(supervisor.status(), SupervisorStatus::NotConnected);

        supervisor.running.store(true, Ordering::SeqCst);
        supervisor.metrics.connection_failed();
        let SupervisorStatus::Active(snapshot) = supervisor.status() else {
            panic!("running supervisor reports its counters");
        };
        assert!(!snapshot.connected);
        assert_eq!(snapshot.connection_errors, 1);
    }
}
