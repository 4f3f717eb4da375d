//! Round-robin selection over the configured broker endpoints
//!
//! Every endpoint is retried in turn; past failures are not scored.

use crate::config::BrokerEndpoint;

/// Cyclic cursor over a fixed, non-empty endpoint list
#[derive(Debug, Clone)]
pub struct EndpointSelector {
    endpoints: Vec<BrokerEndpoint>,
    index: usize,
}

impl EndpointSelector {
    /// Returns `None` for an empty list
    pub fn new(endpoints: Vec<BrokerEndpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        Some(Self {
            endpoints,
            index: 0,
        })
    }

    pub fn current(&self) -> &BrokerEndpoint {
        &self.endpoints[self.index]
    }

    /// Move to the next endpoint, wrapping after the last one
    pub fn advance(&mut self) -> &BrokerEndpoint {
        self.index = (self.index + 1) % self.endpoints.len();
        self.current()
    }

    /// Go back to the primary endpoint
    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn index(&self) -> usize {
        self.index
    }
}
