//! Lock-free consumer metrics
//!
//! One [`ConsumerMetrics`] is created per supervisor and shared by every
//! session and worker slot, so counters survive reconnects. Writers only
//! `fetch_add`/`store`; readers take a [`MetricsSnapshot`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Atomic counters for one consumer lifetime
#[derive(Debug)]
pub struct ConsumerMetrics {
    // Per-delivery counters
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,

    // Connection counters
    connection_errors: AtomicU64,
    connections: AtomicU64,
    reconnects: AtomicU64,
    connected_sessions: AtomicU64,
    active_consumers: AtomicU64,
    last_connection_time: AtomicU64, // unix seconds, 0 = never

    started: Instant,
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected_sessions: AtomicU64::new(0),
            active_consumers: AtomicU64::new(0),
            last_connection_time: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Count a delivery and return the post-increment total
    pub fn message_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn message_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A delivery handed back to the broker for redelivery
    pub fn message_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A session completed its handshake
    pub fn connection_established(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.connected_sessions.fetch_add(1, Ordering::Relaxed);
        self.last_connection_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// A previously connected session released its connection
    pub fn connection_closed(&self) {
        decrement(&self.connected_sessions);
    }

    /// A worker slot connected again after losing an earlier session
    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_started(&self) {
        self.active_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_stopped(&self) {
        decrement(&self.active_consumers);
    }

    /// Zero the per-session gauges once no session can be alive
    pub fn clear_session_gauges(&self) {
        self.connected_sessions.store(0, Ordering::Relaxed);
        self.active_consumers.store(0, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected_sessions.load(Ordering::Relaxed) > 0
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_connection = self.last_connection_time.load(Ordering::Relaxed);
        let uptime = self.uptime();

        MetricsSnapshot {
            messages_received: self.received.load(Ordering::Relaxed),
            messages_processed: self.processed.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            messages_retried: self.retried.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            active_consumers: self.active_consumers.load(Ordering::Relaxed),
            connected: self.is_connected(),
            last_connection_time: (last_connection > 0)
                .then(|| i64::try_from(last_connection).ok())
                .flatten()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            uptime_secs: uptime.as_secs(),
            uptime: format_uptime(uptime),
        }
    }
}

/// Saturating decrement so an unmatched stop never wraps the gauge
fn decrement(gauge: &AtomicU64) {
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
        Some(n.saturating_sub(1))
    });
}

/// Point-in-time view of [`ConsumerMetrics`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub messages_retried: u64,
    pub connection_errors: u64,
    pub connections: u64,
    pub reconnects: u64,
    pub active_consumers: u64,
    pub connected: bool,
    pub last_connection_time: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    /// Human-readable uptime, e.g. `1d 2h 3m 4s`
    pub uptime: String,
}

/// Render a duration as `[Nd ][Nh ][Nm ]Ns`
pub fn format_uptime(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        (total % 86_400) / 3_600,
        (total % 3_600) / 60,
        total % 60,
    );

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
