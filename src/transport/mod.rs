//! Transport layer for the BMS link
//!
//! The connection manager never touches a network client directly. It asks a
//! [`Connector`] to open one [`BrokerSession`] per connection attempt and
//! receives that session's lifecycle through an [`EventSink`]. The production
//! connector wraps rumqttc; tests substitute a scripted one.

use crate::config::{BrokerEndpoint, Credentials};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod mqtt;

use mqtt::client::ManagerEvent;
use mqtt::MqttError;

/// Monotonic identifier of one connection attempt
pub type SessionId = u64;

/// Lifecycle notifications raised by a broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Broker accepted the connection
    ConnAck,
    /// Publish received on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// Broker granted every requested subscription
    Subscribed,
    /// Broker rejected at least one subscription
    SubscribeFailed(String),
    /// Transport or protocol error; the text is matched by
    /// [`mqtt::classify_transport_error`]
    Error(String),
    /// Broker sent DISCONNECT
    Disconnected,
    /// Network went away underneath the session
    Offline,
    /// Session stopped and will raise nothing further
    Closed,
}

/// Everything a connector needs to open one session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub id: SessionId,
    pub endpoint: BrokerEndpoint,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    /// Transport-level connect timeout, independent of the manager's attempt timer
    pub connect_timeout: Duration,
}

/// Delivery channel from one session back to the connection manager
///
/// Every event is stamped with the session id so the manager can discard
/// anything raised by a session it has already replaced.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl EventSink {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<ManagerEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns false once the manager is gone
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(ManagerEvent::Session {
                id: self.session,
                event,
            })
            .is_ok()
    }
}

/// Factory for broker sessions
///
/// `open` must not block: it starts the connection in the background and
/// reports progress through `sink`. An `Err` means the session could not even
/// be set up (bad address, unsupported scheme).
pub trait Connector: Send + Sync {
    fn open(
        &self,
        request: SessionRequest,
        sink: EventSink,
    ) -> Result<Box<dyn BrokerSession>, MqttError>;
}

/// One live or pending broker session
///
/// Calls are non-blocking requests; their outcome arrives as [`SessionEvent`]s.
pub trait BrokerSession: Send {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), MqttError>;

    /// QoS 0, never retained
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    /// Stop the session and release its transport. Idempotent.
    fn close(&mut self);
}
