//! Periodic link supervision
//!
//! A safety net underneath the connection manager's own retries: every tick
//! it checks whether the link is down with nothing in flight and, if so,
//! starts a new attempt.

use super::client::ConnectionManager;
use crate::observability::metrics::metrics;
use crate::state::ConnectionStatus;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Health check loop driver
pub struct HealthMonitor;

impl HealthMonitor {
    /// Reconnect only when neither connected nor already trying (pure function)
    pub fn should_reconnect(status: &ConnectionStatus) -> bool {
        !status.is_connected && !status.is_reconnecting
    }

    /// Run one health check against the manager's current status
    pub fn check(manager: &ConnectionManager) -> bool {
        let status = manager.state().connection_status();
        if !Self::should_reconnect(&status) {
            debug!(
                target: "mqtt_transport",
                connected = status.is_connected,
                "Health check passed"
            );
            return false;
        }

        info!(
            target: "mqtt_transport",
            last_error = ?status.last_error,
            "Health check: link down, attempting reconnection"
        );
        metrics().health_check_reconnect();
        manager.connect();
        true
    }

    /// Spawn the periodic check; the first tick fires one `period` after start.
    ///
    /// Stops when `shutdown_rx` turns true or its sender is dropped.
    pub fn spawn(
        manager: ConnectionManager,
        period: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(target: "mqtt_transport", "Health monitor stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        Self::check(&manager);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_reconnect() {
        let mut status = ConnectionStatus::default();
        assert!(HealthMonitor::should_reconnect(&status));

        status.is_reconnecting = true;
        assert!(!HealthMonitor::should_reconnect(&status));

        status.is_reconnecting = false;
        status.is_connected = true;
        assert!(!HealthMonitor::should_reconnect(&status));

        status.is_reconnecting = true;
        assert!(!HealthMonitor::should_reconnect(&status));
    }
}
