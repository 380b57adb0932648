//! Error taxonomy for the consumer
//!
//! Each layer owns its error enum; `WarrenError` is the union used at the
//! process boundary. Per-message errors never leave the dispatcher and
//! session errors never leave the session, so in practice only
//! configuration errors reach `main`.

use crate::config::ConfigError;
use crate::dispatch::{DecodeError, HandlerFault};
use crate::session::SessionError;
use crate::tls::TlsError;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Crate-level error type
#[derive(Debug, Error)]
pub enum WarrenError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Handler fault: {0}")]
    Handler(#[from] HandlerFault),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WarrenError {
    /// Only misconfiguration may stop the process before the supervisor runs
    pub fn is_fatal(&self) -> bool {
        matches!(self, WarrenError::Config(_))
    }

    /// Process exit status: 1 for rejected configuration, 2 for anything else
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            1
        } else {
            2
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for consumer operations
pub type WarrenResult<T> = Result<T, WarrenError>;

const MAX_MESSAGE_LEN: usize = 500;

fn secret_pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(password|passwd|token|secret|key|api_key|secret_key|private_key)[=:]\s*\S+").expect("valid regex")
    })
}

fn uri_userinfo_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(amqps?://)([^:/@\s]+):([^@\s]+)@").expect("valid regex")
    })
}

/// Scrub credentials from broker error text before it is logged
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = secret_pair_pattern().replace_all(message, "${1}=***");
    let mut sanitized = uri_userinfo_pattern()
        .replace_all(&sanitized, "${1}${2}:***@")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}
