//! Broker transport seam
//!
//! The session talks to the broker only through [`Connector`] and
//! [`BrokerChannel`], so the connection state machine, topology setup and
//! dispatch loop can be exercised against the in-memory broker in
//! [`crate::testing`] as well as the AMQP implementation in [`amqp`].

use crate::config::{Config, ExchangeKind};
use crate::session::SessionError;
use crate::tls::TlsContext;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;

pub mod amqp;

/// Prefix of the companion dead-letter queue
pub const DEAD_LETTER_PREFIX: &str = "dlx.";

/// Name of the dead-letter queue paired with `queue`
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{DEAD_LETTER_PREFIX}{queue}")
}

/// Metadata carried with a delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    /// Publisher-supplied identifier, used for log correlation only
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub app_id: Option<String>,
    /// Header values rendered as strings
    pub headers: BTreeMap<String, String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// One delivered message; `delivery_tag` settles it exactly once
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
        }
    }

    /// The dead-letter sink paired with this queue. It carries no
    /// dead-lettering arguments of its own.
    pub fn dead_letter(&self) -> Self {
        Self {
            name: dead_letter_queue_name(&self.name),
            durable: self.durable,
        }
    }
}

/// Broker reply to a queue declaration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Deliveries for one consumer registration. The stream ends when the
/// consumer is cancelled or the channel closes; an `Err` item is fatal for
/// the channel.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, SessionError>>;

/// An open connection plus channel pair
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Cap unacknowledged deliveries on this channel
    async fn qos(&self, prefetch_count: u16) -> Result<(), SessionError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, SessionError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), SessionError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), SessionError>;

    /// Register a consumer and return its delivery stream
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, SessionError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), SessionError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), SessionError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), SessionError>;

    async fn close_channel(&self) -> Result<(), SessionError>;

    async fn close_connection(&self) -> Result<(), SessionError>;

    /// True while the broker has the connection blocked by a resource alarm
    fn is_blocked(&self) -> bool;
}

/// Opens authenticated connections to the broker
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and one channel. `tls` is `None` only when TLS is
    /// disabled in configuration.
    async fn connect(
        &self,
        config: &Config,
        tls: Option<&TlsContext>,
    ) -> Result<Box<dyn BrokerChannel>, SessionError>;
}
