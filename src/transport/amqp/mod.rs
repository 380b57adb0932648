//! AMQP 0-9-1 implementation of the broker seam on top of lapin
//!
//! - [`connection`] - pure conversions between configuration, lapin and crate types
//! - [`client`] - connection establishment and channel operations

pub mod client;
pub mod connection;

pub use client::{AmqpChannel, AmqpConnector};
pub use connection::{build_amqp_uri, classify_connect_error};
