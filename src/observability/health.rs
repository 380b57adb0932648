//! HTTP health endpoints for container orchestration
//!
//! - `GET /health` - 200 while at least one session is connected, else 503
//! - `GET /metrics` - the current [`MetricsSnapshot`](super::metrics::MetricsSnapshot)
//! - `GET /live` - liveness probe, always 200 while the process serves HTTP

use crate::observability::metrics::ConsumerMetrics;
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connected: bool,
    active_consumers: u64,
    connection_errors: u64,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    uptime: String,
}

/// Serves the health routes for one supervisor's metrics
#[derive(Debug, Clone)]
pub struct HealthServer {
    port: u16,
    metrics: Arc<ConsumerMetrics>,
}

impl HealthServer {
    pub fn new(port: u16, metrics: Arc<ConsumerMetrics>) -> Self {
        Self { port, metrics }
    }

    /// All routes, without binding a socket
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let metrics = self.metrics.clone();
        let with_metrics = warp::any().map(move || metrics.clone());

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_metrics.clone())
            .map(|metrics: Arc<ConsumerMetrics>| {
                let snapshot = metrics.snapshot();
                let (status, code) = if snapshot.connected {
                    ("healthy", StatusCode::OK)
                } else {
                    ("unavailable", StatusCode::SERVICE_UNAVAILABLE)
                };
                let body = HealthResponse {
                    status,
                    connected: snapshot.connected,
                    active_consumers: snapshot.active_consumers,
                    connection_errors: snapshot.connection_errors,
                    timestamp: Utc::now().to_rfc3339(),
                };
                warp::reply::with_status(warp::reply::json(&body), code)
            });

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_metrics.clone())
            .map(|metrics: Arc<ConsumerMetrics>| warp::reply::json(&metrics.snapshot()));

        let live = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_metrics)
            .map(|metrics: Arc<ConsumerMetrics>| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    uptime: metrics.snapshot().uptime,
                })
            });

        health
            .map(|reply| Box::new(reply) as Box<dyn warp::Reply>)
            .or(metrics_route.map(|reply| Box::new(reply) as Box<dyn warp::Reply>))
            .unify()
            .or(live.map(|reply| Box::new(reply) as Box<dyn warp::Reply>))
            .unify()
    }

    /// Serve until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let routes = self.routes();
        let signal = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };

        match warp::serve(routes).try_bind_with_graceful_shutdown(addr, signal) {
            Ok((bound, server)) => {
                tracing::info!(%bound, "Health server listening");
                server.await;
                tracing::info!("Health server stopped");
            }
            Err(e) => tracing::error!(port = self.port, error = %e, "Health server failed to bind"),
        }
    }
}
