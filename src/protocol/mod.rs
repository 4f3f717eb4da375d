//! Message types and topic rules shared with the BMS firmware
//!
//! This module defines the inbound telemetry/status records and the outbound
//! command request.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
