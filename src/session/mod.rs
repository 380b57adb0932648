//! Connection session: one connection + channel pair and its consume loop
//!
//! A session is owned by exactly one supervisor worker slot. Errors never
//! escape it as panics; every failure becomes a state transition plus a
//! logged cause, and the caller learns about it through a `bool` or a
//! `Result` return.

pub mod state;

pub use state::SessionState;

use crate::config::{Config, ExchangeKind};
use crate::dispatch::{Action, Dispatcher, MessageHandler};
use crate::error::sanitize_error_message;
use crate::observability::metrics::ConsumerMetrics;
use crate::tls::{TlsContext, TlsError};
use crate::transport::{BrokerChannel, Connector, QueueSpec};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a consuming session checks whether the broker blocked it
const BLOCKED_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Session-level failures; they never escape the session as faults
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("TLS context could not be built: {0}")]
    TlsSetup(#[from] TlsError),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("Topology error: {0}")]
    Topology(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: SessionState },
    #[error("Unexpected session error: {0}")]
    Unknown(String),
}

/// Typed cause of a failed `connect()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureKind {
    /// TLS material or handshake
    Tls,
    /// Transport, authentication or AMQP protocol failure
    Protocol,
    Unknown,
}

impl SessionError {
    pub fn failure_kind(&self) -> ConnectFailureKind {
        match self {
            SessionError::TlsSetup(_) | SessionError::Tls(_) => ConnectFailureKind::Tls,
            SessionError::Connection(_) | SessionError::Channel(_) => ConnectFailureKind::Protocol,
            SessionError::Topology(_)
            | SessionError::NotConnected { .. }
            | SessionError::Unknown(_) => ConnectFailureKind::Unknown,
        }
    }
}

/// One physical connection and its consumption lifecycle
pub struct Session {
    id: Uuid,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    metrics: Arc<ConsumerMetrics>,
    channel: Option<Box<dyn BrokerChannel>>,
    state: SessionState,
    consumer_tag: Option<String>,
    reconnect_attempts: u32,
    last_failure: Option<ConnectFailureKind>,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    /// `shutdown` flips to `true` when the owner wants consumption to end
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let metrics = dispatcher.metrics().clone();
        Self {
            id: Uuid::new_v4(),
            config,
            connector,
            dispatcher,
            metrics,
            channel: None,
            state: SessionState::Disconnected,
            consumer_tag: None,
            reconnect_attempts: 0,
            last_failure: None,
            shutdown,
        }
    }

    /// Attach the business handler used for subsequent deliveries
    pub fn set_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.dispatcher.set_handler(handler);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected() && self.channel.is_some()
    }

    /// Consecutive failed connects since the last success
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Consumer registration tag while consuming
    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    /// Cause of the most recent failed `connect()`
    pub fn last_failure(&self) -> Option<ConnectFailureKind> {
        self.last_failure
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session = %self.id, from = %self.state, to = %next, "Session state change");
            self.state = next;
        }
    }

    /// Open the connection and channel and apply the prefetch limit.
    ///
    /// Returns false on failure; the attempt is counted in
    /// `connection_errors` and the session stays `Disconnected`. A shutdown
    /// signalled while connecting abandons the attempt without counting it.
    pub async fn connect(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        if *self.shutdown.borrow() {
            debug!(session = %self.id, "Shutdown requested, not connecting");
            return false;
        }

        let mut shutdown = self.shutdown.clone();
        let opened = tokio::select! {
            opened = self.open() => Some(opened),
            _ = shutdown_requested(&mut shutdown) => None,
        };
        let Some(opened) = opened else {
            self.transition(SessionState::Disconnected);
            info!(session = %self.id, "Shutdown requested, connect abandoned");
            return false;
        };

        match opened {
            Ok(channel) => {
                self.channel = Some(channel);
                self.reconnect_attempts = 0;
                self.last_failure = None;
                self.metrics.connection_established();
                self.transition(SessionState::Connected);
                info!(
                    session = %self.id,
                    endpoint = %self.config.display_endpoint(),
                    prefetch = self.config.listener.prefetch_count,
                    "Connected to broker"
                );
                true
            }
            Err(e) => {
                let kind = e.failure_kind();
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                self.last_failure = Some(kind);
                self.metrics.connection_failed();
                self.transition(SessionState::Disconnected);
                error!(
                    session = %self.id,
                    cause = ?kind,
                    attempts = self.reconnect_attempts,
                    error = %sanitize_error_message(&e.to_string()),
                    "Broker connection failed"
                );
                false
            }
        }
    }

    async fn open(&mut self) -> Result<Box<dyn BrokerChannel>, SessionError> {
        self.transition(SessionState::Connecting);

        let tls = if self.config.tls.enabled {
            Some(TlsContext::build(&self.config.tls)?)
        } else {
            warn!(session = %self.id, "TLS disabled, connecting with plain AMQP");
            None
        };

        let channel = self.connector.connect(&self.config, tls.as_ref()).await?;
        if let Err(e) = channel.qos(self.config.listener.prefetch_count).await {
            if let Err(close) = channel.close_connection().await {
                debug!(session = %self.id, error = %close, "Connection close after failed qos failed");
            }
            return Err(e);
        }
        Ok(channel)
    }

    fn channel(&self) -> Result<&dyn BrokerChannel, SessionError> {
        self.channel
            .as_deref()
            .ok_or(SessionError::NotConnected { state: self.state })
    }

    /// Declare `queue` and its `dlx.` companion together
    pub async fn declare_topology(&self, queue: &str) -> bool {
        match self.try_declare_topology(queue).await {
            Ok(()) => true,
            Err(e) => {
                error!(session = %self.id, queue, error = %e, "Topology declaration failed");
                false
            }
        }
    }

    async fn try_declare_topology(&self, queue: &str) -> Result<(), SessionError> {
        let channel = self.channel()?;
        let primary = QueueSpec::new(queue, self.config.durable);
        let dead_letter = primary.dead_letter();

        for spec in [&primary, &dead_letter] {
            let info = channel.declare_queue(spec).await?;
            info!(
                queue = %spec.name,
                durable = spec.durable,
                messages = info.message_count,
                consumers = info.consumer_count,
                "Queue declared"
            );
        }
        Ok(())
    }

    /// Declare an exchange. A failure leaves the session usable.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), SessionError> {
        self.channel()?
            .declare_exchange(name, kind, self.config.durable)
            .await?;
        info!(exchange = name, kind = %kind, "Exchange declared");
        Ok(())
    }

    /// Bind `queue` to `exchange`. A failure leaves the session usable.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), SessionError> {
        self.channel()?
            .bind_queue(queue, exchange, routing_key)
            .await?;
        info!(queue, exchange, routing_key, "Queue bound");
        Ok(())
    }

    /// Declare topology, register a consumer and deliver messages until
    /// shutdown is signalled (`Ok`) or the broker/channel fails (`Err`).
    ///
    /// On `Ok` the session has been closed and is `Stopped`; on `Err` its
    /// resources are released and it is `Disconnected`.
    pub async fn start_consuming(&mut self, queue: &str, auto_ack: bool) -> Result<(), SessionError> {
        let result = self.consume(queue, auto_ack).await;
        match &result {
            Ok(()) => self.close().await,
            Err(e) => {
                error!(
                    session = %self.id,
                    queue,
                    error = %sanitize_error_message(&e.to_string()),
                    "Consumption ended by error"
                );
                self.stop().await;
                self.release().await;
                self.transition(SessionState::Disconnected);
            }
        }
        result
    }

    async fn consume(&mut self, queue: &str, auto_ack: bool) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected { state: self.state });
        }

        self.try_declare_topology(queue).await?;
        self.bind_configured_exchange(queue).await;

        let tag = format!("warren-{}", Uuid::new_v4());
        let mut deliveries = self.channel()?.consume(queue, &tag, auto_ack).await?;
        self.consumer_tag = Some(tag);
        self.metrics.consumer_started();
        self.transition(SessionState::Consuming);
        info!(session = %self.id, queue, auto_ack, "Consuming");

        let blocked_limit = self.config.connection.blocked_connection_timeout();
        let mut blocked_check = tokio::time::interval(BLOCKED_CHECK_INTERVAL);
        blocked_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut blocked_since: Option<Instant> = None;

        loop {
            if *self.shutdown.borrow() {
                info!(session = %self.id, "Shutdown requested, leaving consume loop");
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // owner went away without signalling
                        return Ok(());
                    }
                    continue;
                }
                _ = blocked_check.tick(), if blocked_limit.is_some() => {
                    if let Some(limit) = blocked_limit {
                        self.check_blocked(limit, &mut blocked_since)?;
                    }
                    continue;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(SessionError::Channel(
                        "consumer stream closed by broker".to_string(),
                    ))
                }
            };

            let action = self.dispatcher.on_delivery(&delivery).await;
            if auto_ack {
                debug!(delivery_tag = delivery.delivery_tag, ?action, "auto-ack consumer, action not sent");
                continue;
            }

            let channel = self.channel()?;
            match action {
                Action::Ack => channel.ack(delivery.delivery_tag).await?,
                Action::Reject { requeue } => {
                    channel.reject(delivery.delivery_tag, requeue).await?
                }
            }
        }
    }

    /// Fail once the broker has kept the connection blocked for `limit`
    fn check_blocked(
        &self,
        limit: Duration,
        blocked_since: &mut Option<Instant>,
    ) -> Result<(), SessionError> {
        let blocked = self.channel()?.is_blocked();
        match (*blocked_since, blocked) {
            (None, true) => {
                warn!(session = %self.id, timeout_secs = limit.as_secs(), "Broker blocked the connection");
                *blocked_since = Some(Instant::now());
            }
            (Some(_), false) => {
                info!(session = %self.id, "Broker unblocked the connection");
                *blocked_since = None;
            }
            (Some(since), true) if since.elapsed() >= limit => {
                return Err(SessionError::Channel(format!(
                    "connection blocked by broker for more than {}s",
                    limit.as_secs()
                )));
            }
            _ => {}
        }
        Ok(())
    }

    async fn bind_configured_exchange(&self, queue: &str) {
        let Some(exchange) = self.config.queue.exchange.as_deref() else {
            return;
        };
        if let Err(e) = self
            .declare_exchange(exchange, self.config.queue.exchange_kind)
            .await
        {
            warn!(exchange, error = %e, "Exchange declaration failed, consuming without binding");
            return;
        }
        if let Err(e) = self
            .bind_queue(queue, exchange, &self.config.queue.routing_key)
            .await
        {
            warn!(queue, exchange, error = %e, "Queue binding failed");
        }
    }

    /// Cancel the consumer registration. Safe to call in any state.
    pub async fn stop(&mut self) {
        let Some(tag) = self.consumer_tag.take() else {
            return;
        };
        if let Some(channel) = self.channel.as_deref() {
            if let Err(e) = channel.cancel(&tag).await {
                warn!(consumer_tag = %tag, error = %e, "Consumer cancel failed");
            }
        }
        self.metrics.consumer_stopped();
        if self.state == SessionState::Consuming {
            self.transition(SessionState::Stopping);
        }
    }

    /// Close channel then connection, each step guarded independently
    async fn release(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if let Err(e) = channel.close_channel().await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = channel.close_connection().await {
            debug!(error = %e, "Connection close failed");
        }
        self.metrics.connection_closed();
    }

    /// Best-effort teardown: cancel consumption, close channel, close
    /// connection. Always ends in `Stopped`.
    pub async fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.transition(SessionState::Stopping);
        self.stop().await;
        self.release().await;
        self.transition(SessionState::Stopped);
        info!(session = %self.id, "Session closed");
    }
}

/// Resolves once shutdown is signalled; pends forever if the owner is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("consumer_tag", &self.consumer_tag)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish()
    }
}
