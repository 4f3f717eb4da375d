//! Testing utilities and mock implementations
//!
//! Lets the connection manager and the monitor facade be exercised without a
//! running MQTT broker.

pub mod mocks;

pub use mocks::*;
