//! Impure I/O coordination for the MQTT link
//!
//! [`ConnectionManager`] owns at most one broker session at a time. Session
//! events, attempt timeouts and retry timers are all funnelled into a single
//! dispatch task, so every decision about the link is made in one place and
//! in arrival order. Public calls (`connect`, `send_command`, `disconnect`)
//! take the same lock and return without awaiting.

use super::connection::{
    classify_transport_error, generate_client_id, next_phase, MqttError, ReconnectPolicy,
    SessionPhase, TransportErrorKind,
};
use super::endpoints::EndpointSelector;
use super::message_handler::MessageRouter;
use super::rate_limiter::RateLimiter;
use crate::command_span;
use crate::config::{
    BrokerEndpoint, CredentialSource, MonitorConfig, TelemetrySection, TopicsSection,
};
use crate::error::truncate_message;
use crate::observability::metrics::metrics;
use crate::protocol::CommandRequest;
use crate::state::{Notification, SharedState};
use crate::transport::{
    BrokerSession, Connector, EventSink, SessionEvent, SessionId, SessionRequest,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Work items for the dispatch task
#[derive(Debug)]
pub(crate) enum ManagerEvent {
    Session { id: SessionId, event: SessionEvent },
    AttemptTimedOut(SessionId),
    RetryDue,
}

/// Static settings for a connection manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub endpoints: Vec<BrokerEndpoint>,
    pub topics: TopicsSection,
    pub telemetry: TelemetrySection,
    pub credentials: CredentialSource,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub command_interval: Duration,
    pub policy: ReconnectPolicy,
}

impl ManagerSettings {
    /// Settings from a loaded configuration
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            endpoints: config.broker.endpoints.clone(),
            topics: config.topics.clone(),
            telemetry: config.telemetry.clone(),
            credentials: config.credential_source(),
            keep_alive: Duration::from_secs(config.broker.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.broker.connect_timeout_secs),
            command_interval: Duration::from_millis(config.commands.min_interval_ms),
            policy: ReconnectPolicy::from_config(&config.reconnect),
        }
    }
}

struct ActiveSession {
    id: SessionId,
    endpoint: BrokerEndpoint,
    handle: Box<dyn BrokerSession>,
    opened_at: Instant,
}

/// Mutable link state, guarded by one lock
struct Core {
    phase: SessionPhase,
    session: Option<ActiveSession>,
    endpoints: EndpointSelector,
    limiter: RateLimiter,
    last_session_id: SessionId,
    attempt_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl Core {
    fn current_session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    fn teardown_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!(
                target: "mqtt_transport",
                session = session.id,
                endpoint = %session.endpoint.name,
                "Tearing down MQTT session"
            );
            session.handle.close();
        }
    }

    fn cancel_attempt_timer(&mut self) {
        if let Some(timer) = self.attempt_timer.take() {
            timer.abort();
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn set_retry(&mut self, timer: JoinHandle<()>) {
        self.cancel_retry();
        self.retry_timer = Some(timer);
    }

    fn shutdown(&mut self) {
        self.cancel_attempt_timer();
        self.cancel_retry();
        self.teardown_session();
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    state: SharedState,
    router: MessageRouter,
    topics: TopicsSection,
    credentials: CredentialSource,
    keep_alive: Duration,
    connect_timeout: Duration,
    policy: ReconnectPolicy,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    core: Mutex<Core>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle onto the broker link
///
/// Must be created inside a Tokio runtime. The link shuts down when the last
/// clone is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("phase", &self.phase())
            .field("endpoint_index", &self.endpoint_index())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        settings: ManagerSettings,
        connector: Arc<dyn Connector>,
        state: SharedState,
    ) -> Result<Self, MqttError> {
        let endpoints = EndpointSelector::new(settings.endpoints).ok_or(MqttError::NoEndpoints)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            connector,
            router: MessageRouter::new(&settings.topics, &settings.telemetry, state.clone()),
            state,
            topics: settings.topics,
            credentials: settings.credentials,
            keep_alive: settings.keep_alive,
            connect_timeout: settings.connect_timeout,
            policy: settings.policy,
            events_tx,
            core: Mutex::new(Core {
                phase: SessionPhase::Idle,
                session: None,
                endpoints,
                limiter: RateLimiter::new(settings.command_interval),
                last_session_id: 0,
                attempt_timer: None,
                retry_timer: None,
            }),
            dispatcher: Mutex::new(None),
        });

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&inner), events_rx));
        *inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

        Ok(Self { inner })
    }

    /// Start a connection attempt against the current endpoint.
    ///
    /// Does nothing while an attempt is in flight or the link is up.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Publish a command on the control topic.
    ///
    /// Returns false, and tells the user why, when the link is down, the
    /// rate limiter denies the call, or the publish cannot be queued.
    pub fn send_command(&self, command: &str, value: Option<bool>) -> bool {
        self.inner.send_command(command, value)
    }

    /// Drop the session and every pending timer. `connect` may be called again later.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn state(&self) -> &SharedState {
        &self.inner.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.core().phase.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.core().phase.is_connected()
    }

    /// Index of the endpoint the next attempt will use
    pub fn endpoint_index(&self) -> usize {
        self.inner.core().endpoints.index()
    }

    pub fn current_endpoint(&self) -> BrokerEndpoint {
        self.inner.core().endpoints.current().clone()
    }
}

/// Drain manager events until the manager is dropped
async fn dispatch(inner: Weak<Inner>, mut events_rx: mpsc::UnboundedReceiver<ManagerEvent>) {
    while let Some(event) = events_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event);
    }
    debug!(target: "mqtt_transport", "Connection manager dispatcher stopped");
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `event` to the dispatcher after `delay`
    fn schedule(&self, event: ManagerEvent, delay: Duration) -> JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        let deadline = Instant::now() + delay;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events_tx.send(event);
        })
    }

    fn connect(&self) {
        let mut core = self.core();
        if core.phase.is_active() {
            debug!(target: "mqtt_transport", phase = ?core.phase, "Connection already in progress");
            return;
        }

        core.cancel_retry();
        core.cancel_attempt_timer();
        core.teardown_session();

        core.last_session_id += 1;
        let id = core.last_session_id;
        let endpoint = core.endpoints.current().clone();
        let _span = crate::mqtt_span!(session = id, endpoint = %endpoint.name).entered();

        info!(address = %endpoint.address, "Attempting MQTT connection");
        metrics().mqtt_connection_attempt();
        self.state.update_status(|status| {
            status.is_reconnecting = true;
            status.last_error = None;
            status.endpoint = Some(endpoint.name.clone());
        });

        let request = SessionRequest {
            id,
            endpoint: endpoint.clone(),
            client_id: generate_client_id(),
            credentials: self.credentials.resolve(),
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
        };
        let sink = EventSink::new(id, self.events_tx.clone());

        match self.connector.open(request, sink) {
            Ok(handle) => {
                core.session = Some(ActiveSession {
                    id,
                    endpoint,
                    handle,
                    opened_at: Instant::now(),
                });
                core.phase = SessionPhase::Connecting(id);
                core.attempt_timer = Some(self.schedule(
                    ManagerEvent::AttemptTimedOut(id),
                    self.policy.attempt_timeout,
                ));
            }
            Err(e) => {
                let message = e.to_string();
                let successful_connects = self.state.connection_status().reconnect_attempts;
                let delay = self.policy.setup_backoff(successful_connects);

                error!(error = %message, retry_in = ?delay, "Failed to set up MQTT session");
                metrics().mqtt_setup_failed();
                core.phase = SessionPhase::Errored(message.clone());
                self.state.update_status(|status| {
                    status.is_connected = false;
                    status.is_reconnecting = false;
                    status.last_error = Some(message.clone());
                });
                self.state
                    .notify(Notification::error("Connection failed", truncate_message(&message)));
                let timer = self.schedule(ManagerEvent::RetryDue, delay);
                core.set_retry(timer);
            }
        }
    }

    fn handle_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::Session { id, event } => self.on_session_event(id, event),
            ManagerEvent::AttemptTimedOut(id) => self.on_attempt_timeout(id),
            ManagerEvent::RetryDue => self.connect(),
        }
    }

    fn on_session_event(&self, id: SessionId, event: SessionEvent) {
        let mut core = self.core();
        if core.current_session_id() != Some(id) {
            debug!(
                target: "mqtt_transport",
                session = id,
                ?event,
                "Ignoring event from superseded session"
            );
            return;
        }

        let previous = core.phase.clone();
        core.phase = next_phase(&previous, &event);

        match event {
            SessionEvent::ConnAck => {
                if !core.phase.is_connected() || previous.is_connected() {
                    return;
                }
                core.cancel_attempt_timer();
                core.endpoints.reset();

                let Some(session) = core.session.as_mut() else {
                    return;
                };
                info!(
                    target: "mqtt_transport",
                    session = id,
                    endpoint = %session.endpoint.name,
                    "MQTT connected"
                );
                metrics().mqtt_connection_established(session.opened_at.elapsed());
                self.state.update_status(|status| {
                    status.is_connected = true;
                    status.is_reconnecting = false;
                    status.reconnect_attempts += 1;
                    status.last_error = None;
                });

                if let Err(e) = session.handle.subscribe(&self.topics.inbound()) {
                    self.report_subscribe_failure(e.to_string());
                }
            }
            SessionEvent::Message { topic, payload } => {
                drop(core);
                self.router.route(&topic, &payload);
            }
            SessionEvent::Subscribed => {
                let endpoint = core
                    .session
                    .as_ref()
                    .map(|s| s.endpoint.name.clone())
                    .unwrap_or_default();
                info!(
                    target: "mqtt_transport",
                    topics = ?self.topics.inbound(),
                    "Subscribed to BMS topics"
                );
                self.state.notify(Notification::info(
                    "Connected",
                    format!("Receiving BMS data via {endpoint}"),
                ));
            }
            SessionEvent::SubscribeFailed(reason) => {
                self.report_subscribe_failure(format!("Subscription failed: {reason}"));
            }
            SessionEvent::Error(message) => {
                core.cancel_attempt_timer();
                metrics().mqtt_transport_error();
                self.state.update_status(|status| {
                    status.is_connected = false;
                    status.is_reconnecting = false;
                    status.last_error = Some(message.clone());
                });

                let kind = classify_transport_error(&message);
                match kind {
                    TransportErrorKind::ConnAckTimeout => {
                        let next = core.endpoints.advance().name.clone();
                        warn!(
                            target: "mqtt_transport",
                            error = %message,
                            next_endpoint = %next,
                            "Broker did not acknowledge, trying next endpoint"
                        );
                        self.state.notify(Notification::error(
                            "Connection timeout",
                            format!("Trying {next}..."),
                        ));
                    }
                    TransportErrorKind::ConnectionRefused => {
                        error!(
                            target: "mqtt_transport",
                            error = %message,
                            "Broker refused the connection"
                        );
                        self.state.notify(Notification::error(
                            "Connection refused",
                            "Check the broker credentials",
                        ));
                    }
                    TransportErrorKind::Other => {
                        error!(target: "mqtt_transport", error = %message, "MQTT connection error");
                        self.state.notify(Notification::error(
                            "Connection error",
                            truncate_message(&message),
                        ));
                    }
                }

                if let Some(delay) = self.policy.retry_after(kind) {
                    let timer = self.schedule(ManagerEvent::RetryDue, delay);
                    core.set_retry(timer);
                }
            }
            SessionEvent::Disconnected | SessionEvent::Closed => {
                core.cancel_attempt_timer();
                if previous.is_connected() {
                    info!(target: "mqtt_transport", session = id, "MQTT connection closed");
                }
                metrics().mqtt_connection_lost();
                self.state.update_status(|status| {
                    status.is_connected = false;
                    status.is_reconnecting = false;
                });
            }
            SessionEvent::Offline => {
                warn!(target: "mqtt_transport", session = id, "MQTT client offline");
                metrics().mqtt_connection_lost();
                self.state.update_status(|status| status.is_connected = false);
            }
        }
    }

    fn report_subscribe_failure(&self, message: String) {
        // The link stays up; data simply does not arrive
        warn!(target: "mqtt_transport", error = %message, "Subscription failed");
        self.state
            .notify(Notification::error("Subscription failed", truncate_message(&message)));
        self.state
            .update_status(|status| status.last_error = Some(message));
    }

    fn on_attempt_timeout(&self, id: SessionId) {
        let mut core = self.core();
        if core.phase != SessionPhase::Connecting(id) {
            return;
        }
        core.attempt_timer = None;

        let endpoint = core
            .session
            .as_ref()
            .map(|s| s.endpoint.name.clone())
            .unwrap_or_default();
        core.teardown_session();
        let next = core.endpoints.advance().name.clone();
        core.phase = SessionPhase::TimedOut;

        warn!(
            target: "mqtt_transport",
            session = id,
            endpoint = %endpoint,
            next_endpoint = %next,
            "Connection attempt timed out"
        );
        metrics().mqtt_connection_timeout();
        self.state.update_status(|status| {
            status.is_connected = false;
            status.is_reconnecting = false;
            status.last_error = Some(format!("Timeout with {endpoint}"));
        });

        let timer = self.schedule(ManagerEvent::RetryDue, self.policy.timeout_retry_delay);
        core.set_retry(timer);
    }

    fn send_command(&self, command: &str, value: Option<bool>) -> bool {
        let _span = command_span!(command = %command).entered();
        let mut guard = self.core();
        let core = &mut *guard;

        let session = match (&core.phase, core.session.as_mut()) {
            (SessionPhase::Connected(_), Some(session)) => session,
            (phase, _) => {
                let e = MqttError::NotConnected {
                    phase: phase.clone(),
                };
                warn!(error = %e, "Cannot send command - MQTT not connected");
                metrics().command_rejected_offline();
                self.state.notify(Notification::error(
                    "Not connected",
                    "Cannot send commands while the BMS link is down",
                ));
                return false;
            }
        };

        if !core.limiter.try_acquire() {
            let wait_ms = core.limiter.min_interval().as_millis();
            warn!(min_interval_ms = wait_ms as u64, "Command rate limited");
            metrics().command_rate_limited();
            self.state.notify(Notification::error(
                "Too many commands",
                format!("Wait {wait_ms} ms between commands"),
            ));
            return false;
        }

        let request = CommandRequest::now(command, value);
        let published = request
            .to_payload()
            .map_err(MqttError::from)
            .and_then(|payload| session.handle.publish(&self.topics.control, payload));

        match published {
            Ok(()) => {
                info!(value = request.value, topic = %self.topics.control, "Command sent");
                metrics().command_sent();
                self.state.notify(Notification::info(
                    "Command sent",
                    format!("{command} = {}", request.value),
                ));
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to publish command");
                metrics().command_publish_failed();
                self.state.notify(Notification::error(
                    "Command failed",
                    truncate_message(&format!("Could not send {command}: {e}")),
                ));
                false
            }
        }
    }

    fn disconnect(&self) {
        let mut core = self.core();
        core.shutdown();
        core.phase = SessionPhase::Idle;
        metrics().mqtt_connection_lost();
        self.state.update_status(|status| {
            status.is_connected = false;
            status.is_reconnecting = false;
        });
        info!(target: "mqtt_transport", "MQTT client disconnected");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();

        if let Some(handle) = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
