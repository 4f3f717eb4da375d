//! MQTT link to the BMS gateway
//!
//! The module separates pure decisions from I/O:
//!
//! - [`connection`] - Session phases, retry timing, error classification, option building
//! - [`endpoints`] - Round-robin endpoint selection
//! - [`rate_limiter`] - Minimum spacing between outbound commands
//! - [`message_handler`] - rumqttc event mapping and inbound message routing
//! - [`health_monitor`] - Periodic reconnection safety net
//! - [`session`] - rumqttc-backed broker sessions
//! - [`client`] - The connection manager coordinating all of the above
//!
//! # Usage
//!
//! ```rust,no_run
//! use bmslink::config::MonitorConfig;
//! use bmslink::state::SharedState;
//! use bmslink::transport::mqtt::{ConnectionManager, ManagerSettings, RumqttConnector};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MonitorConfig::load_from_file("bmslink.toml".as_ref())?;
//! let manager = ConnectionManager::new(
//!     ManagerSettings::from_config(&config),
//!     Arc::new(RumqttConnector::new()),
//!     SharedState::new(),
//! )?;
//! manager.connect();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod endpoints;
pub mod health_monitor;
pub mod message_handler;
pub mod rate_limiter;
pub mod session;

pub use client::{ConnectionManager, ManagerSettings};
pub use connection::{
    classify_transport_error, generate_client_id, next_phase, MqttError, ReconnectPolicy,
    SessionPhase, TransportErrorKind,
};
pub use endpoints::EndpointSelector;
pub use health_monitor::HealthMonitor;
pub use message_handler::{
    EventRoute, InboundRecord, MessageHandler, MessageRouter, Rejection, RouteOutcome,
};
pub use rate_limiter::RateLimiter;
pub use session::{RumqttConnector, RumqttSession};
