//! In-memory broker and scripted handlers
//!
//! [`MockBroker`] implements [`Connector`] and hands out channels that
//! behave like AMQP 0-9-1 channels where it matters to a consumer: per-channel
//! prefetch accounting, ack/reject with requeue, redelivery of unacked
//! messages when a channel closes, and injectable connection faults.

use crate::config::{Config, ExchangeKind};
use crate::dispatch::{HandlerFault, HandlerOutcome, MessageHandler};
use crate::session::SessionError;
use crate::tls::TlsContext;
use crate::transport::{
    BrokerChannel, Connector, Delivery, DeliveryStream, MessageProperties, QueueInfo, QueueSpec,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Observable broker-side events, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Delivered { tag: u64, body: Bytes },
    Acked { tag: u64 },
    Rejected { tag: u64, requeue: bool },
}

/// Kind of error returned by a failing connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFault {
    Tls,
    Refused,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
}

#[derive(Debug, Default)]
struct MockQueue {
    /// `None` until declared; publishing may create a queue implicitly
    durable: Option<bool>,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    queue: String,
    channel_id: u64,
    prefetch: u16,
    auto_ack: bool,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, SessionError>>,
}

#[derive(Debug)]
struct Unacked {
    channel_id: u64,
    consumer_tag: String,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, MockQueue>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<(String, String, String)>,
    consumers: Vec<Consumer>,
    unacked: HashMap<u64, Unacked>,
    prefetch: HashMap<u64, u16>,
    closed_channels: HashSet<u64>,
    events: Vec<BrokerEvent>,
    next_tag: u64,
    next_channel: u64,
    connects: u32,
    failing_connects: u32,
    connect_fault: Option<ConnectFault>,
    connect_delay: Option<Duration>,
    fail_exchange_declare: bool,
    fail_qos: bool,
    blocked: bool,
}

impl BrokerState {
    fn requeue_front(&mut self, queue: &str, mut message: StoredMessage) {
        message.properties.redelivered = true;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_front(message);
    }

    /// Push ready messages to consumers with prefetch headroom
    fn pump(&mut self) {
        let BrokerState {
            queues,
            consumers,
            unacked,
            events,
            next_tag,
            ..
        } = self;

        for consumer in consumers.iter_mut() {
            let Some(queue) = queues.get_mut(&consumer.queue) else {
                continue;
            };
            while consumer.auto_ack
                || consumer.prefetch == 0
                || consumer.in_flight < usize::from(consumer.prefetch)
            {
                let Some(message) = queue.ready.pop_front() else {
                    break;
                };
                *next_tag += 1;
                let tag = *next_tag;
                let delivery = Delivery {
                    delivery_tag: tag,
                    body: message.body.clone(),
                    properties: MessageProperties {
                        routing_key: consumer.queue.clone(),
                        ..message.properties.clone()
                    },
                };
                if consumer.sender.send(Ok(delivery)).is_err() {
                    queue.ready.push_front(message);
                    break;
                }
                events.push(BrokerEvent::Delivered {
                    tag,
                    body: message.body.clone(),
                });
                if !consumer.auto_ack {
                    consumer.in_flight += 1;
                    unacked.insert(
                        tag,
                        Unacked {
                            channel_id: consumer.channel_id,
                            consumer_tag: consumer.tag.clone(),
                            queue: consumer.queue.clone(),
                            message,
                        },
                    );
                }
            }
        }
        consumers.retain(|c| !c.sender.is_closed());
    }

    fn settle(&mut self, tag: u64) -> Result<Unacked, SessionError> {
        let entry = self.unacked.remove(&tag).ok_or_else(|| {
            SessionError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))
        })?;
        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.tag == entry.consumer_tag)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        Ok(entry)
    }

    fn close_channel(&mut self, channel_id: u64) {
        if !self.closed_channels.insert(channel_id) {
            return;
        }
        self.consumers.retain(|c| c.channel_id != channel_id);
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        let mut returned: Vec<(u64, Unacked)> = tags
            .into_iter()
            .filter_map(|tag| self.unacked.remove(&tag).map(|u| (tag, u)))
            .collect();
        // oldest first ends up at the front
        returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, entry) in returned {
            self.requeue_front(&entry.queue, entry.message);
        }
        self.pump();
    }
}

/// Shared in-memory broker; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` connects fail with `fault`
    pub fn fail_next_connects(&self, count: u32, fault: ConnectFault) {
        let mut state = self.lock();
        state.failing_connects = count;
        state.connect_fault = Some(fault);
    }

    /// Refuse every exchange declaration
    pub fn fail_exchange_declarations(&self) {
        self.lock().fail_exchange_declare = true;
    }

    /// Refuse every `basic.qos` with a channel error
    pub fn fail_qos(&self) {
        self.lock().fail_qos = true;
    }

    /// Hold every connect for `delay` before answering
    pub fn delay_connects(&self, delay: Duration) {
        self.lock().connect_delay = Some(delay);
    }

    /// Raise or clear a broker resource alarm on every connection
    pub fn set_blocked(&self, blocked: bool) {
        self.lock().blocked = blocked;
    }

    /// Enqueue a JSON or raw body on `queue`
    pub fn publish(&self, queue: &str, body: impl Into<Bytes>) {
        self.publish_with_properties(queue, body, MessageProperties::default());
    }

    pub fn publish_with_properties(
        &self,
        queue: &str,
        body: impl Into<Bytes>,
        properties: MessageProperties,
    ) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                body: body.into(),
                properties,
            });
        state.pump();
    }

    /// Drop every open channel as if the broker restarted
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        for consumer in &state.consumers {
            let _ = consumer
                .sender
                .send(Err(SessionError::Channel("connection reset by broker".into())));
        }
        let open: Vec<u64> = (1..=state.next_channel)
            .filter(|id| !state.closed_channels.contains(id))
            .collect();
        for id in open {
            state.close_channel(id);
        }
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    /// Declared durability of `queue`, `None` when never declared
    pub fn queue_durability(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).and_then(|q| q.durable)
    }

    /// Messages waiting in `queue`
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries not yet settled
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Channels opened and not yet closed
    pub fn open_channel_count(&self) -> usize {
        let state = self.lock();
        (1..=state.next_channel)
            .filter(|id| !state.closed_channels.contains(id))
            .count()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(exchange).copied()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.clone()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.lock().events.clone()
    }

    pub fn acked_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, BrokerEvent::Acked { .. }))
            .count()
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn connect(
        &self,
        _config: &Config,
        _tls: Option<&TlsContext>,
    ) -> Result<Box<dyn BrokerChannel>, SessionError> {
        let delay = self.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(match state.connect_fault {
                Some(ConnectFault::Tls) => {
                    SessionError::Tls("invalid peer certificate: UnknownIssuer".into())
                }
                _ => SessionError::Connection("connection refused".into()),
            });
        }
        state.next_channel += 1;
        Ok(Box::new(MockChannel {
            broker: self.clone(),
            id: state.next_channel,
        }))
    }
}

/// Channel handed out by [`MockBroker`]
#[derive(Debug)]
pub struct MockChannel {
    broker: MockBroker,
    id: u64,
}

impl MockChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, SessionError> {
        let state = self.broker.lock();
        if state.closed_channels.contains(&self.id) {
            return Err(SessionError::Channel(format!("channel {} is closed", self.id)));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), SessionError> {
        let mut state = self.open_state()?;
        if state.fail_qos {
            return Err(SessionError::Channel(
                "NOT_IMPLEMENTED - prefetch_count not supported".into(),
            ));
        }
        state.prefetch.insert(self.id, prefetch_count);
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, SessionError> {
        let mut state = self.open_state()?;
        let consumers = state
            .consumers
            .iter()
            .filter(|c| c.queue == spec.name)
            .count();
        let queue = state.queues.entry(spec.name.clone()).or_default();
        match queue.durable {
            Some(durable) if durable != spec.durable => {
                return Err(SessionError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    spec.name
                )))
            }
            _ => queue.durable = Some(spec.durable),
        }
        Ok(QueueInfo {
            message_count: u32::try_from(queue.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(consumers).unwrap_or(u32::MAX),
        })
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), SessionError> {
        let mut state = self.open_state()?;
        if state.fail_exchange_declare {
            return Err(SessionError::Topology(format!(
                "ACCESS_REFUSED - exchange '{name}'"
            )));
        }
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(SessionError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
            ))),
            _ => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), SessionError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(SessionError::Topology(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let binding = (queue.to_string(), exchange.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, SessionError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(SessionError::Channel(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let prefetch = state.prefetch.get(&self.id).copied().unwrap_or(0);
        state.consumers.push(Consumer {
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            channel_id: self.id,
            prefetch,
            auto_ack,
            in_flight: 0,
            sender,
        });
        state.pump();

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), SessionError> {
        let mut state = self.open_state()?;
        state.settle(delivery_tag)?;
        state.events.push(BrokerEvent::Acked { tag: delivery_tag });
        state.pump();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), SessionError> {
        let mut state = self.open_state()?;
        let entry = state.settle(delivery_tag)?;
        state.events.push(BrokerEvent::Rejected {
            tag: delivery_tag,
            requeue,
        });
        if requeue {
            state.requeue_front(&entry.queue, entry.message);
        }
        state.pump();
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), SessionError> {
        self.open_state()?
            .consumers
            .retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    async fn close_channel(&self) -> Result<(), SessionError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }

    async fn close_connection(&self) -> Result<(), SessionError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }

    fn is_blocked(&self) -> bool {
        self.broker.lock().blocked
    }
}

/// One scripted handler response
#[derive(Debug, Clone)]
pub enum Step {
    Return(HandlerOutcome),
    Fault(String),
    Panic(String),
    /// Sleep, then return the outcome
    Delay(Duration, HandlerOutcome),
}

/// Handler that plays back a script, then answers `fallback`
#[derive(Debug)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Step>>,
    fallback: HandlerOutcome,
    calls: Mutex<Vec<Value>>,
}

impl ScriptedHandler {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            fallback: HandlerOutcome::Accept,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Handler that always answers `outcome`
    pub fn always(outcome: HandlerOutcome) -> Self {
        Self {
            fallback: outcome,
            ..Self::new([])
        }
    }

    /// Payloads seen so far, in call order
    pub fn calls(&self) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(
        &self,
        payload: &Value,
        _properties: &MessageProperties,
    ) -> Result<HandlerOutcome, HandlerFault> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(payload.clone());
        let step = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();

        match step {
            None => Ok(self.fallback),
            Some(Step::Return(outcome)) => Ok(outcome),
            Some(Step::Fault(message)) => Err(HandlerFault::new(message)),
            Some(Step::Panic(message)) => panic!("{message}"),
            Some(Step::Delay(duration, outcome)) => {
                tokio::time::sleep(duration).await;
                Ok(outcome)
            }
        }
    }
}
