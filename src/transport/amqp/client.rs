//! Impure I/O for the AMQP transport
//!
//! Connection establishment (TCP, TLS, AMQP handshake) and the channel
//! operations the session needs, all through lapin.

use super::connection::{
    build_amqp_uri, classify_connect_error, connection_properties, lapin_exchange_kind,
    message_properties,
};
use crate::config::{Config, ExchangeKind};
use crate::error::sanitize_error_message;
use crate::session::SessionError;
use crate::tls::TlsContext;
use crate::transport::{BrokerChannel, Connector, Delivery, DeliveryStream, QueueInfo, QueueSpec};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::{AMQPUriTcpExt, RustlsConnector};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{Channel, Connection};
use tracing::{debug, info, warn};

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections, over rustls unless TLS is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }

    /// One TCP + TLS + AMQP handshake
    async fn open(config: &Config, tls: Option<&TlsContext>) -> Result<AmqpChannel, SessionError> {
        let uri = build_amqp_uri(config);
        let properties = connection_properties();

        let connection = match tls {
            Some(context) => {
                let connector = RustlsConnector::from(context.client_config());
                Connection::connector(
                    uri,
                    Box::new(move |uri: &AMQPUri| {
                        uri.connect()
                            .and_then(|stream| stream.into_rustls(&connector, &uri.authority.host))
                    }),
                    properties,
                )
                .await
            }
            None => Connection::connect_uri(uri, properties).await,
        }
        .map_err(|e| classify_connect_error(&e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SessionError::Connection(format!("channel open failed: {e}")))?;

        Ok(AmqpChannel {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        config: &Config,
        tls: Option<&TlsContext>,
    ) -> Result<Box<dyn BrokerChannel>, SessionError> {
        let attempts = config.connection.connection_attempts.max(1);
        let socket_timeout = config.connection.socket_timeout();
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!(
                attempt,
                attempts,
                endpoint = %config.display_endpoint(),
                "Opening broker connection"
            );
            let result = tokio::time::timeout(socket_timeout, Self::open(config, tls))
                .await
                .unwrap_or_else(|_| {
                    Err(SessionError::Connection(format!(
                        "connection attempt timed out after {}s",
                        socket_timeout.as_secs()
                    )))
                });

            match result {
                Ok(channel) => {
                    info!(attempt, endpoint = %config.display_endpoint(), "Broker connection open");
                    return Ok(Box::new(channel));
                }
                Err(e) => {
                    if attempt < attempts {
                        warn!(
                            attempt,
                            attempts,
                            error = %sanitize_error_message(&e.to_string()),
                            "Connection attempt failed, retrying in {}s",
                            config.connection.retry_delay
                        );
                        tokio::time::sleep(config.connection.retry_delay()).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SessionError::Unknown("no connection attempt made".to_string())))
    }
}

/// One lapin connection with its single channel
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

fn channel_error(operation: &str, error: lapin::Error) -> SessionError {
    SessionError::Channel(format!("{operation} failed: {error}"))
}

fn topology_error(operation: &str, error: lapin::Error) -> SessionError {
    SessionError::Topology(format!("{operation} failed: {error}"))
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), SessionError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| channel_error("basic.qos", e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, SessionError> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| topology_error("queue.declare", e))?;

        Ok(QueueInfo {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), SessionError> {
        self.channel
            .exchange_declare(
                name,
                lapin_exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| topology_error("exchange.declare", e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), SessionError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| topology_error("queue.bind", e))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, SessionError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| channel_error("basic.consume", e))?;

        Ok(consumer
            .map(|item| {
                item.map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    properties: message_properties(&delivery),
                    body: Bytes::from(delivery.data),
                })
                .map_err(|e| SessionError::Channel(format!("delivery failed: {e}")))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), SessionError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| channel_error("basic.ack", e))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), SessionError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| channel_error("basic.nack", e))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), SessionError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| channel_error("basic.cancel", e))
    }

    async fn close_channel(&self) -> Result<(), SessionError> {
        self.channel
            .close(REPLY_SUCCESS, "consumer closing")
            .await
            .map_err(|e| channel_error("channel.close", e))
    }

    async fn close_connection(&self) -> Result<(), SessionError> {
        self.connection
            .close(REPLY_SUCCESS, "consumer closing")
            .await
            .map_err(|e| SessionError::Connection(format!("connection.close failed: {e}")))
    }

    fn is_blocked(&self) -> bool {
        self.connection.status().blocked()
    }
}
