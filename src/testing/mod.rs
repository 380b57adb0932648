//! Test doubles for the broker seam and the handler contract
//!
//! Lets the session, dispatcher and supervisor run end to end without a
//! broker process.

pub mod mocks;

pub use mocks::*;
