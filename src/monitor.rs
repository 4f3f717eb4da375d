//! Dashboard-facing facade over the BMS link
//!
//! [`BmsMonitor`] wires the connection manager, the shared state and the
//! health monitor together and exposes what a dashboard needs: the latest
//! snapshots, connection status, staleness, and command dispatch.

use crate::config::MonitorConfig;
use crate::error::{BmsError, BmsResult};
use crate::protocol::BmsCommand;
use crate::state::{
    ConnectionStatus, Notification, SharedState, SystemStatusSnapshot, TelemetrySnapshot,
};
use crate::transport::mqtt::{ConnectionManager, HealthMonitor, ManagerSettings, RumqttConnector};
use crate::transport::Connector;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// Connection manager plus health supervision and read accessors
pub struct BmsMonitor {
    manager: ConnectionManager,
    state: SharedState,
    stale_after: Duration,
    health_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    health_task: Option<JoinHandle<()>>,
}

impl BmsMonitor {
    /// Monitor talking to real brokers through rumqttc
    pub fn new(config: &MonitorConfig) -> BmsResult<Self> {
        Self::with_connector(config, Arc::new(RumqttConnector::new()))
    }

    /// Monitor using a caller-supplied connector
    pub fn with_connector(
        config: &MonitorConfig,
        connector: Arc<dyn Connector>,
    ) -> BmsResult<Self> {
        config.validate()?;
        let state = SharedState::new();
        let manager =
            ConnectionManager::new(ManagerSettings::from_config(config), connector, state.clone())?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            manager,
            state,
            stale_after: config.telemetry.stale_after(),
            health_interval: config.reconnect.health_check_interval(),
            shutdown_tx,
            health_task: None,
        })
    }

    /// Connect and start the periodic health check. Calling twice is harmless.
    pub fn start(&mut self) {
        self.manager.connect();
        if self.health_task.is_none() {
            info!(interval = ?self.health_interval, "Starting BMS link health monitor");
            self.health_task = Some(HealthMonitor::spawn(
                self.manager.clone(),
                self.health_interval,
                self.shutdown_tx.subscribe(),
            ));
        }
    }

    /// Stop health checks and close the link
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.health_task.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Health monitor task ended abnormally: {}", e);
            }
        }
        self.manager.disconnect();
        info!("BMS monitor stopped");
    }

    pub fn telemetry(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.state.telemetry()
    }

    pub fn system_status(&self) -> Option<Arc<SystemStatusSnapshot>> {
        self.state.system_status()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state.connection_status()
    }

    pub fn is_connected(&self) -> bool {
        self.state.connection_status().is_connected
    }

    /// Arrival time of the latest telemetry record
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.telemetry().map(|snapshot| snapshot.received_at)
    }

    /// True when telemetry exists but is older than the staleness threshold
    pub fn is_data_stale(&self) -> bool {
        self.is_data_stale_at(Utc::now())
    }

    pub fn is_data_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.state
            .telemetry()
            .is_some_and(|snapshot| snapshot.is_stale_at(now, self.stale_after))
    }

    /// Send a raw command name; see [`ConnectionManager::send_command`]
    pub fn send_command(&self, command: &str, value: Option<bool>) -> bool {
        self.manager.send_command(command, value)
    }

    pub fn send(&self, command: BmsCommand, value: Option<bool>) -> bool {
        self.manager.send_command(command.as_str(), value)
    }

    /// Parse a command name and send it
    pub fn send_named(&self, command: &str, value: Option<bool>) -> BmsResult<bool> {
        let command = command
            .parse::<BmsCommand>()
            .map_err(|_| BmsError::unknown_command(command))?;
        Ok(self.send(command, value))
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.state.watch_status()
    }

    pub fn watch_telemetry(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.state.watch_telemetry()
    }

    pub fn watch_system_status(&self) -> watch::Receiver<Option<Arc<SystemStatusSnapshot>>> {
        self.state.watch_system_status()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.state.notifications()
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Drop for BmsMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.health_task.take() {
            handle.abort();
        }
    }
}
