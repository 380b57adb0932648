//! Message dispatch: decode, invoke the handler, decide the broker action
//!
//! The dispatcher never talks to the broker. It turns one [`Delivery`] into
//! one [`Action`] and records metrics on every branch; the session applies
//! the action with the delivery tag.

use crate::delivery_span;
use crate::observability::metrics::ConsumerMetrics;
use crate::transport::{Delivery, MessageProperties};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};

/// Longest body prefix written to logs
const BODY_PREVIEW_LIMIT: usize = 500;

/// What the handler decided about a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Permanently successful
    Accept,
    /// Permanently failed; discard without redelivery
    Reject,
    /// Transient failure; redeliver
    Retry,
}

/// Broker action for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ack,
    Reject { requeue: bool },
}

impl Action {
    pub const DISCARD: Action = Action::Reject { requeue: false };
    pub const REQUEUE: Action = Action::Reject { requeue: true };
}

impl From<HandlerOutcome> for Action {
    fn from(outcome: HandlerOutcome) -> Self {
        match outcome {
            HandlerOutcome::Accept => Action::Ack,
            HandlerOutcome::Reject => Action::DISCARD,
            HandlerOutcome::Retry => Action::REQUEUE,
        }
    }
}

/// The body could not be decoded into a structured payload
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Unexpected handler failure; always treated as transient
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerFault {
    message: String,
}

impl HandlerFault {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Business logic invoked once per delivery.
///
/// Implementations must return in bounded time; nothing here enforces a
/// timeout and the channel is throttled while the handler runs.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &Value,
        properties: &MessageProperties,
    ) -> Result<HandlerOutcome, HandlerFault>;
}

/// Decode a body as UTF-8 JSON
pub fn decode_payload(body: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(body)?;
    Ok(serde_json::from_str(text)?)
}

/// Lossy, length-capped rendering of a body for logs
pub fn body_preview(body: &[u8]) -> String {
    let end = body.len().min(BODY_PREVIEW_LIMIT);
    let mut preview = String::from_utf8_lossy(&body[..end]).into_owned();
    if body.len() > BODY_PREVIEW_LIMIT {
        preview.push_str("...");
    }
    preview
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

/// Maps deliveries to actions through an optional handler
#[derive(Clone)]
pub struct Dispatcher {
    handler: Option<Arc<dyn MessageHandler>>,
    metrics: Arc<ConsumerMetrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(metrics: Arc<ConsumerMetrics>) -> Self {
        Self {
            handler: None,
            metrics,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn set_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handler = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    /// Decide the action for one delivery
    pub async fn on_delivery(&self, delivery: &Delivery) -> Action {
        let sequence = self.metrics.message_received();
        let message_id = delivery
            .properties
            .message_id
            .clone()
            .unwrap_or_else(|| format!("msg-{sequence}"));

        let span = delivery_span!(
            message_id = %message_id,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.properties.redelivered
        );
        self.dispatch(delivery, &message_id).instrument(span).await
    }

    async fn dispatch(&self, delivery: &Delivery, message_id: &str) -> Action {
        debug!(bytes = delivery.body.len(), "Received message");

        let payload = match decode_payload(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    error = %e,
                    body = %body_preview(&delivery.body),
                    "Discarding undecodable message {message_id}"
                );
                self.metrics.message_failed();
                return Action::DISCARD;
            }
        };

        let Some(handler) = &self.handler else {
            debug!("No handler registered, acknowledging {message_id}");
            self.metrics.message_processed();
            return Action::Ack;
        };

        let result = AssertUnwindSafe(handler.handle(&payload, &delivery.properties))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(HandlerOutcome::Accept)) => {
                info!("Processed message {message_id}");
                self.metrics.message_processed();
                Action::Ack
            }
            Ok(Ok(HandlerOutcome::Reject)) => {
                warn!("Handler rejected message {message_id}, discarding");
                self.metrics.message_failed();
                Action::DISCARD
            }
            Ok(Ok(HandlerOutcome::Retry)) => {
                warn!("Handler requested retry for message {message_id}, requeueing");
                self.metrics.message_retried();
                Action::REQUEUE
            }
            Ok(Err(fault)) => {
                error!(fault = %fault, "Handler fault on message {message_id}, requeueing");
                self.metrics.message_retried();
                Action::REQUEUE
            }
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked on message {message_id}, requeueing"
                );
                self.metrics.message_retried();
                Action::REQUEUE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 1,
            body: Bytes::copy_from_slice(body),
            properties: MessageProperties::default(),
        }
    }

    struct Fixed(Result<HandlerOutcome, HandlerFault>);

    #[async_trait]
    impl MessageHandler for Fixed {
        async fn handle(
            &self,
            _payload: &Value,
            _properties: &MessageProperties,
        ) -> Result<HandlerOutcome, HandlerFault> {
            self.0.clone()
        }
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(
            &self,
            _payload: &Value,
            _properties: &MessageProperties,
        ) -> Result<HandlerOutcome, HandlerFault> {
            panic!("handler exploded");
        }
    }

    fn dispatcher_with(handler: impl MessageHandler + 'static) -> Dispatcher {
        Dispatcher::new(Arc::new(ConsumerMetrics::new())).with_handler(Arc::new(handler))
    }

    #[test]
    fn test_outcome_to_action() {
        assert_eq!(Action::from(HandlerOutcome::Accept), Action::Ack);
        assert_eq!(
            Action::from(HandlerOutcome::Reject),
            Action::Reject { requeue: false }
        );
        assert_eq!(
            Action::from(HandlerOutcome::Retry),
            Action::Reject { requeue: true }
        );
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(br#"{"a":1}"#).unwrap()["a"], 1);
        assert!(matches!(decode_payload(b"{oops"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode_payload(&[0xff, 0xfe]),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn test_body_preview_is_capped() {
        let preview = body_preview(&vec![b'a'; 2_000]);
        assert_eq!(preview.len(), BODY_PREVIEW_LIMIT + 3);
        assert_eq!(body_preview(b"short"), "short");
    }

    #[tokio::test]
    async fn test_no_handler_acks() {
        let dispatcher = Dispatcher::new(Arc::new(ConsumerMetrics::new()));
        assert_eq!(dispatcher.on_delivery(&delivery(b"{}")).await, Action::Ack);
        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.messages_processed, 1);
    }

    #[tokio::test]
    async fn test_decode_failure_discards_even_with_handler() {
        let dispatcher = dispatcher_with(Fixed(Ok(HandlerOutcome::Accept)));
        let action = dispatcher.on_delivery(&delivery(b"not json")).await;
        assert_eq!(action, Action::DISCARD);
        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.messages_failed, 1);
        assert_eq!(snapshot.messages_processed, 0);
    }

    #[tokio::test]
    async fn test_reject_discards() {
        let dispatcher = dispatcher_with(Fixed(Ok(HandlerOutcome::Reject)));
        assert_eq!(
            dispatcher.on_delivery(&delivery(b"{}")).await,
            Action::DISCARD
        );
        assert_eq!(dispatcher.metrics().snapshot().messages_failed, 1);
    }

    #[tokio::test]
    async fn test_fault_requeues_without_failing() {
        let dispatcher = dispatcher_with(Fixed(Err(HandlerFault::new("db down"))));
        assert_eq!(
            dispatcher.on_delivery(&delivery(b"{}")).await,
            Action::REQUEUE
        );
        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.messages_failed, 0);
        assert_eq!(snapshot.messages_processed, 0);
        assert_eq!(snapshot.messages_retried, 1);
    }

    #[tokio::test]
    async fn test_panic_requeues() {
        let dispatcher = dispatcher_with(Panicking);
        assert_eq!(
            dispatcher.on_delivery(&delivery(b"{}")).await,
            Action::REQUEUE
        );
        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.messages_failed, 0);
        assert_eq!(snapshot.messages_processed, 0);
    }
}
