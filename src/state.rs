//! Shared, observable state read by dashboard consumers
//!
//! Connection status and the two latest snapshots live in `watch` channels so
//! that a reader always sees a complete value: writers replace or modify the
//! whole record under the channel's lock and readers clone it out. Transient
//! user-facing notifications travel on a `broadcast` channel.
//!
//! Writer discipline: connection-level status fields are written by the
//! connection manager only, `messages_received` and the snapshots by the
//! message router only. The write methods are crate-private to keep it so.

use crate::protocol::{BmsTelemetry, DeviceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Capacity of the notification channel; slow consumers lose the oldest entries
const NOTIFICATION_CAPACITY: usize = 64;

/// Connectivity record exposed to consumers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    /// A connection attempt is underway and has not resolved yet
    pub is_reconnecting: bool,
    /// Number of successful connects since start (not failed attempts)
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    /// Messages accepted by the router
    pub messages_received: u64,
    /// Name of the endpoint in use or being tried
    pub endpoint: Option<String>,
}

/// Coarse connection state for status badges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    Connected,
    Connecting,
    Disconnected,
}

impl ConnectionStatus {
    pub fn link_health(&self) -> LinkHealth {
        if self.is_connected {
            LinkHealth::Connected
        } else if self.is_reconnecting {
            LinkHealth::Connecting
        } else {
            LinkHealth::Disconnected
        }
    }
}

/// Latest record received on one inbound topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot<T> {
    pub record: T,
    /// Wall-clock arrival time on this host
    pub received_at: DateTime<Utc>,
}

pub type TelemetrySnapshot = Snapshot<BmsTelemetry>;
pub type SystemStatusSnapshot = Snapshot<DeviceStatus>;

impl<T> Snapshot<T> {
    pub fn new(record: T, received_at: DateTime<Utc>) -> Self {
        Self {
            record,
            received_at,
        }
    }

    /// Age of the snapshot at `now`; zero if the clock went backwards
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.received_at).to_std().unwrap_or_default()
    }

    /// True once strictly more than `threshold` has elapsed since arrival
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age_at(now) > threshold
    }
}

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Error,
}

/// Transient message meant for the person watching the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub description: String,
}

impl Notification {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            title: title.into(),
            description: description.into(),
        }
    }
}

struct Channels {
    status: watch::Sender<ConnectionStatus>,
    telemetry: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
    system_status: watch::Sender<Option<Arc<SystemStatusSnapshot>>>,
    notifications: broadcast::Sender<Notification>,
}

/// Cloneable handle onto the shared state channels
#[derive(Clone)]
pub struct SharedState {
    channels: Arc<Channels>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("status", &*self.channels.status.borrow())
            .finish_non_exhaustive()
    }
}

impl SharedState {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (telemetry, _) = watch::channel(None);
        let (system_status, _) = watch::channel(None);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Self {
            channels: Arc::new(Channels {
                status,
                telemetry,
                system_status,
                notifications,
            }),
        }
    }

    /// Copy of the current connection status
    pub fn connection_status(&self) -> ConnectionStatus {
        self.channels.status.borrow().clone()
    }

    pub fn telemetry(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.channels.telemetry.borrow().clone()
    }

    pub fn system_status(&self) -> Option<Arc<SystemStatusSnapshot>> {
        self.channels.system_status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.channels.status.subscribe()
    }

    pub fn watch_telemetry(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.channels.telemetry.subscribe()
    }

    pub fn watch_system_status(&self) -> watch::Receiver<Option<Arc<SystemStatusSnapshot>>> {
        self.channels.system_status.subscribe()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.channels.notifications.subscribe()
    }

    /// Apply a connection-level change as one atomic replacement
    pub(crate) fn update_status(&self, apply: impl FnOnce(&mut ConnectionStatus)) {
        self.channels.status.send_modify(apply);
    }

    pub(crate) fn replace_telemetry(&self, snapshot: TelemetrySnapshot) {
        self.channels.telemetry.send_replace(Some(Arc::new(snapshot)));
        self.count_message();
    }

    pub(crate) fn replace_system_status(&self, snapshot: SystemStatusSnapshot) {
        self.channels
            .system_status
            .send_replace(Some(Arc::new(snapshot)));
        self.count_message();
    }

    fn count_message(&self) {
        self.channels
            .status
            .send_modify(|status| status.messages_received += 1);
    }

    /// Fan a notification out to every listener; dropped when nobody listens
    pub(crate) fn notify(&self, notification: Notification) {
        let _ = self.channels.notifications.send(notification);
    }
}
