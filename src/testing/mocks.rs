//! Mock implementations for testing
//!
//! [`MockConnector`] stands in for the rumqttc connector. It records every
//! session the connection manager opens and hands tests a
//! [`MockSessionHandle`] to script broker behaviour (ConnAck, messages,
//! errors) and inspect what the manager subscribed to and published.

use crate::transport::mqtt::MqttError;
use crate::transport::{BrokerSession, Connector, EventSink, SessionEvent, SessionRequest};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the manager did with one session
#[derive(Debug, Default)]
struct SessionLog {
    subscriptions: Vec<Vec<String>>,
    published: Vec<PublishedMessage>,
    closed: bool,
    fail_subscribe: bool,
    fail_publish: bool,
}

#[derive(Debug, Default)]
struct ConnectorState {
    sessions: Vec<MockSessionHandle>,
    setup_failures: u32,
}

/// Scriptable connector recording every opened session
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `open` fail as if the address were bad
    pub fn fail_next_setups(&self, count: u32) {
        lock(&self.state).setup_failures = count;
    }

    /// Number of sessions opened successfully
    pub fn open_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn session(&self, index: usize) -> Option<MockSessionHandle> {
        lock(&self.state).sessions.get(index).cloned()
    }

    pub fn last_session(&self) -> Option<MockSessionHandle> {
        lock(&self.state).sessions.last().cloned()
    }

    /// Endpoint names in the order sessions were opened
    pub fn endpoint_history(&self) -> Vec<String> {
        lock(&self.state)
            .sessions
            .iter()
            .map(|s| s.request.endpoint.name.clone())
            .collect()
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        request: SessionRequest,
        sink: EventSink,
    ) -> Result<Box<dyn BrokerSession>, MqttError> {
        let mut state = lock(&self.state);
        if state.setup_failures > 0 {
            state.setup_failures -= 1;
            return Err(MqttError::InvalidBrokerUrl(request.endpoint.address));
        }

        let log = Arc::new(Mutex::new(SessionLog::default()));
        state.sessions.push(MockSessionHandle {
            request,
            sink,
            log: log.clone(),
        });
        Ok(Box::new(MockSession { log }))
    }
}

/// Session object handed to the connection manager
#[derive(Debug)]
pub struct MockSession {
    log: Arc<Mutex<SessionLog>>,
}

impl BrokerSession for MockSession {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), MqttError> {
        let mut log = lock(&self.log);
        if log.fail_subscribe {
            return Err(MqttError::SubscriptionFailed("mock subscribe failure".into()));
        }
        log.subscriptions.push(topics.to_vec());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        let mut log = lock(&self.log);
        if log.fail_publish {
            return Err(MqttError::PublishFailed("mock publish failure".into()));
        }
        log.published.push((topic.to_string(), payload));
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.log).closed = true;
    }
}

/// Test-side view of one opened session
#[derive(Debug, Clone)]
pub struct MockSessionHandle {
    pub request: SessionRequest,
    sink: EventSink,
    log: Arc<Mutex<SessionLog>>,
}

impl MockSessionHandle {
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.sink.emit(event)
    }

    pub fn ack(&self) -> bool {
        self.emit(SessionEvent::ConnAck)
    }

    pub fn message(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.emit(SessionEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    pub fn error(&self, message: &str) -> bool {
        self.emit(SessionEvent::Error(message.to_string()))
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        lock(&self.log).subscriptions.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.log).published.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.log).closed
    }

    pub fn fail_subscribe(&self, fail: bool) {
        lock(&self.log).fail_subscribe = fail;
    }

    pub fn fail_publish(&self, fail: bool) {
        lock(&self.log).fail_publish = fail;
    }
}
