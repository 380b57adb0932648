//! Pure conversions between configuration, lapin and crate types
//!
//! Nothing here performs I/O; the impure side lives in [`super::client`].

use crate::config::{Config, ExchangeKind};
use crate::session::SessionError;
use crate::transport::MessageProperties;
use lapin::types::AMQPValue;
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::ConnectionProperties;
use std::collections::BTreeMap;

/// Client-provided connection name shown in the broker management UI
pub const CONNECTION_NAME: &str = "warren";

/// Build the connection URI. The scheme is always plain AMQP: TLS is layered
/// on by the connector with our own rustls context rather than the broker
/// client's default one.
pub fn build_amqp_uri(config: &Config) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.scheme = AMQPScheme::AMQP;
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.authority.userinfo.username = config.username.clone();
    uri.authority.userinfo.password = config.password.clone();
    uri.vhost = config.virtual_host.clone();
    uri.query.heartbeat = Some(heartbeat_secs(config.connection.heartbeat));
    uri.query.connection_timeout = Some(config.connection.socket_timeout.saturating_mul(1000));
    uri
}

/// AMQP heartbeats are negotiated as a 16-bit number of seconds
fn heartbeat_secs(heartbeat: u64) -> u16 {
    u16::try_from(heartbeat).unwrap_or(u16::MAX)
}

pub fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into())
}

pub fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// Extract the metadata we expose to handlers from a lapin delivery
pub fn message_properties(delivery: &lapin::message::Delivery) -> MessageProperties {
    let props = &delivery.properties;
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_string(), render_header(value)))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    MessageProperties {
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        app_id: props.app_id().as_ref().map(|s| s.as_str().to_string()),
        headers,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
    }
}

/// Render a header value for logs and handlers
pub fn render_header(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::ShortShortInt(n) => n.to_string(),
        AMQPValue::ShortShortUInt(n) => n.to_string(),
        AMQPValue::ShortInt(n) => n.to_string(),
        AMQPValue::ShortUInt(n) => n.to_string(),
        AMQPValue::LongInt(n) => n.to_string(),
        AMQPValue::LongUInt(n) => n.to_string(),
        AMQPValue::LongLongInt(n) => n.to_string(),
        AMQPValue::Timestamp(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

fn looks_like_tls_failure(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    ["tls", "certificate", "handshake", "alert", "x509", "unknownissuer"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Classify a failed connection attempt into the session error taxonomy
pub fn classify_connect_error(error: &lapin::Error) -> SessionError {
    let text = error.to_string();
    match error {
        lapin::Error::IOError(io) if looks_like_tls_failure(&io.to_string()) => {
            SessionError::Tls(text)
        }
        lapin::Error::IOError(_) | lapin::Error::ProtocolError(_) => {
            SessionError::Connection(text)
        }
        lapin::Error::InvalidConnectionState(_) => SessionError::Connection(text),
        _ if looks_like_tls_failure(&text) => SessionError::Tls(text),
        _ => SessionError::Unknown(text),
    }
}
