//! Periodic human-readable status report

use crate::observability::metrics::ConsumerMetrics;
use crate::supervisor::SupervisorStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Multi-line status block. Counters are shown whenever the consumer is
/// running, including while it reconnects.
pub fn render_status(status: &SupervisorStatus) -> String {
    let SupervisorStatus::Active(snapshot) = status else {
        return "Consumer status: not running".to_string();
    };
    let header = if snapshot.connected {
        "Consumer status: connected"
    } else {
        "Consumer status: disconnected (reconnecting)"
    };

    let last_connection = snapshot
        .last_connection_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    [
        header.to_string(),
        format!("  messages received:   {}", snapshot.messages_received),
        format!("  messages processed:  {}", snapshot.messages_processed),
        format!("  messages failed:     {}", snapshot.messages_failed),
        format!("  messages retried:    {}", snapshot.messages_retried),
        format!("  connection errors:   {}", snapshot.connection_errors),
        format!("  active consumers:    {}", snapshot.active_consumers),
        format!("  last connection:     {last_connection}"),
        format!("  uptime:              {}", snapshot.uptime),
    ]
    .join("\n")
}

/// Log the status block every `period` until `shutdown` flips to `true`.
/// Meant to run alongside a started supervisor.
pub fn spawn_status_reporter(
    metrics: Arc<ConsumerMetrics>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("{}", render_status(&SupervisorStatus::Active(metrics.snapshot())));
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
    })
}
