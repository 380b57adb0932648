//! Warren - self-healing TLS consumer for durable AMQP queues
//!
//! Warren keeps one or more consumers attached to a durable queue for as
//! long as the process runs, across network faults, broker restarts and
//! handler failures.
//!
//! # Overview
//!
//! - [`config`] - layered TOML configuration with documented defaults
//! - [`tls`] - hardened rustls client context (version floor, mutual TLS)
//! - [`session`] - one connection + channel, topology and the consume loop
//! - [`dispatch`] - decode, run the handler, decide ack / reject / requeue
//! - [`supervisor`] - restart loop with bounded backoff and worker slots
//! - [`observability`] - logging, metrics, status reports, health endpoints
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warren::dispatch::{HandlerFault, HandlerOutcome, MessageHandler};
//! use warren::transport::{amqp::AmqpConnector, MessageProperties};
//! use warren::{Config, Supervisor};
//!
//! struct Orders;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Orders {
//!     async fn handle(
//!         &self,
//!         payload: &serde_json::Value,
//!         _properties: &MessageProperties,
//!     ) -> Result<HandlerOutcome, HandlerFault> {
//!         Ok(match payload.get("order_id") {
//!             Some(_) => HandlerOutcome::Accept,
//!             None => HandlerOutcome::Reject,
//!         })
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let config = Config::load_from_file("warren.toml".as_ref())?;
//! let mut supervisor =
//!     Supervisor::new(config, Arc::new(AmqpConnector::new())).with_handler(Arc::new(Orders));
//! supervisor.start("orders");
//! // ... wait for a shutdown signal ...
//! supervisor.stop().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod session;
pub mod supervisor;
pub mod testing;
pub mod tls;
pub mod transport;

pub use config::{Config, ConfigError};
pub use dispatch::{Action, Dispatcher, HandlerFault, HandlerOutcome, MessageHandler};
pub use error::{WarrenError, WarrenResult};
pub use session::{ConnectFailureKind, Session, SessionError, SessionState};
pub use supervisor::{Supervisor, SupervisorStatus};
pub use tls::{TlsContext, TlsError};
