//! bmslink - resilient MQTT link to a battery management system
//!
//! This crate keeps a dashboard connected to a BMS gateway over MQTT:
//! - Round-robin failover across several broker endpoints
//! - Attempt timeouts, error-specific retry delays and a periodic health check
//! - Size-bounded, typed routing of telemetry and device status messages
//! - Rate-limited command publishing
//! - Observable connection status, snapshots and user notifications
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bmslink::config::MonitorConfig;
//! use bmslink::monitor::BmsMonitor;
//! use bmslink::protocol::BmsCommand;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MonitorConfig::load_from_file("bmslink.toml".as_ref())?;
//! let mut monitor = BmsMonitor::new(&config)?;
//! monitor.start();
//!
//! let mut status = monitor.watch_status();
//! while !status.borrow_and_update().is_connected {
//!     status.changed().await?;
//! }
//!
//! if let Some(snapshot) = monitor.telemetry() {
//!     println!("SOC: {:?}", snapshot.record.soc);
//! }
//! monitor.send(BmsCommand::ChargeEnable, Some(false));
//! monitor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod monitor;
pub mod observability;
pub mod protocol;
pub mod state;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{BmsError, BmsResult};
pub use monitor::BmsMonitor;
pub use protocol::*;
pub use state::{ConnectionStatus, Notification, Severity, SharedState};
pub use transport::mqtt::ConnectionManager;
