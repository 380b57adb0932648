//! Session lifecycle states

use std::fmt;

/// Where a session is in its lifecycle.
///
/// `Disconnected → Connecting → Connected → Consuming` on the happy path;
/// any step may fall back to `Disconnected`, and shutdown goes through
/// `Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Consuming,
    Stopping,
    Stopped,
}

impl SessionState {
    /// A connection and channel are open
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Consuming)
    }

    /// No further work will happen in this session
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Consuming => "consuming",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
