//! Observability: structured logging, metrics, status reports and health endpoints

pub mod health;
pub mod logging;
pub mod metrics;
pub mod status;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use status::{render_status, spawn_status_reporter};

pub use logging::{delivery_span, session_span};
