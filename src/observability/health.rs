//! Health check HTTP server
//!
//! Exposes link status, metrics and the latest BMS snapshots over HTTP for
//! operators and process supervisors.

use crate::error::{BmsError, BmsResult};
use crate::observability::metrics::metrics;
use crate::state::{ConnectionStatus, LinkHealth, SharedState};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    state: SharedState,
    stale_after: Duration,
}

impl HealthServer {
    pub fn new(port: u16, state: SharedState, stale_after: Duration) -> Self {
        Self {
            port,
            state,
            stale_after,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the HTTP health server; runs until the task is dropped
    pub async fn start(self: Arc<Self>) -> BmsResult<()> {
        let health_server = self.clone();
        let ready_server = self.clone();
        let snapshot_server = self.clone();

        // GET /health - link and data freshness
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status();
                let code = if status.status == "unhealthy" {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - connected to a broker
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.state.connection_status().is_connected;
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - process is up
        let live_route = warp::path("live").and(warp::get()).and_then(|| async {
            let response = LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            };
            Ok::<_, Infallible>(warp::reply::json(&response))
        });

        // GET /snapshot - latest telemetry and device status
        let snapshot_route = warp::path("snapshot").and(warp::get()).and_then(move || {
            let server = snapshot_server.clone();
            async move { Ok::<_, Infallible>(warp::reply::json(&server.snapshot())) }
        });

        // GET / - API documentation
        let root_route = warp::path::end().and(warp::get()).and_then(|| async {
            let endpoints: HashMap<&str, &str> = [
                ("/health", "Link status and data freshness"),
                ("/metrics", "Connection, message and command counters"),
                ("/ready", "200 while connected to a broker"),
                ("/live", "Liveness probe"),
                ("/snapshot", "Latest BMS telemetry and device status"),
            ]
            .into_iter()
            .collect();
            Ok::<_, Infallible>(warp::reply::json(&ApiDocumentationResponse { endpoints }))
        });

        let routes = health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(snapshot_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin());

        let (address, server) = warp::serve(routes)
            .try_bind_ephemeral(([0, 0, 0, 0], self.port))
            .map_err(|e| BmsError::HealthServer {
                message: format!("cannot bind port {}: {e}", self.port),
            })?;

        tracing::info!("Health server listening on {}", address);
        server.await;

        Ok(())
    }

    fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let connection = self.state.connection_status();

        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), Self::check_link(&connection, now));
        checks.insert("telemetry".to_string(), self.check_telemetry(now));

        let status = if !connection.is_connected {
            "unhealthy"
        } else if checks.values().all(|check| check.status == "healthy") {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: status.to_string(),
            timestamp: now,
            uptime_seconds: metrics().get_metrics().uptime_seconds,
            connection,
            checks,
        }
    }

    fn check_link(connection: &ConnectionStatus, now: u64) -> HealthCheck {
        let (status, message) = match connection.link_health() {
            LinkHealth::Connected => (
                "healthy",
                format!(
                    "Connected via {}",
                    connection.endpoint.as_deref().unwrap_or("unknown endpoint")
                ),
            ),
            LinkHealth::Connecting => ("connecting", "Connection attempt in progress".to_string()),
            LinkHealth::Disconnected => (
                "unhealthy",
                connection
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Not connected".to_string()),
            ),
        };

        HealthCheck {
            status: status.to_string(),
            message: Some(message),
            last_check: now,
        }
    }

    fn check_telemetry(&self, now: u64) -> HealthCheck {
        let (status, message) = match self.state.telemetry() {
            None => ("healthy", "No telemetry received yet".to_string()),
            Some(snapshot) if snapshot.is_stale_at(Utc::now(), self.stale_after) => (
                "stale",
                format!(
                    "No telemetry for {} seconds",
                    snapshot.age_at(Utc::now()).as_secs()
                ),
            ),
            Some(_) => ("healthy", "Telemetry is current".to_string()),
        };

        HealthCheck {
            status: status.to_string(),
            message: Some(message),
            last_check: now,
        }
    }

    fn snapshot(&self) -> SnapshotResponse {
        let telemetry = self.state.telemetry();
        SnapshotResponse {
            connection: self.state.connection_status(),
            stale: telemetry
                .as_ref()
                .is_some_and(|s| s.is_stale_at(Utc::now(), self.stale_after)),
            cell_stats: telemetry.as_ref().and_then(|s| s.record.cell_stats()),
            telemetry: telemetry.map(|s| (*s).clone()),
            system_status: self.state.system_status().map(|s| (*s).clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    uptime_seconds: u64,
    connection: ConnectionStatus,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    connection: ConnectionStatus,
    stale: bool,
    telemetry: Option<crate::state::TelemetrySnapshot>,
    system_status: Option<crate::state::SystemStatusSnapshot>,
    cell_stats: Option<crate::protocol::CellStats>,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: HashMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
