//! Pure connection state management for the MQTT link
//!
//! This module contains the session phase machine, retry timing, error
//! classification and rumqttc option building. Nothing here performs I/O.

use crate::config::ReconnectSection;
use crate::transport::{SessionEvent, SessionId, SessionRequest};
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Where the current connection attempt stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session has been opened yet, or the link was shut down
    Idle,
    /// Session opened, waiting for ConnAck
    Connecting(SessionId),
    /// ConnAck received
    Connected(SessionId),
    /// Session closed by the broker or the network
    Disconnected(String),
    /// Session reported an error
    Errored(String),
    /// Attempt timer fired before ConnAck
    TimedOut,
}

impl SessionPhase {
    /// An attempt is in flight or established; a new connect must not start
    pub fn is_active(&self) -> bool {
        matches!(self, SessionPhase::Connecting(_) | SessionPhase::Connected(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionPhase::Connected(_))
    }
}

/// Phase after `event` arrives for the current session (pure function)
///
/// Events that carry no phase change (messages, subscription results)
/// leave the phase as is. A ConnAck only counts while connecting.
pub fn next_phase(current: &SessionPhase, event: &SessionEvent) -> SessionPhase {
    match (current, event) {
        (SessionPhase::Connecting(id), SessionEvent::ConnAck) => SessionPhase::Connected(*id),
        (_, SessionEvent::Error(message)) => SessionPhase::Errored(message.clone()),
        (SessionPhase::Errored(_), SessionEvent::Closed) => current.clone(),
        (_, SessionEvent::Closed) => SessionPhase::Disconnected("Connection closed".to_string()),
        (_, SessionEvent::Disconnected) => {
            SessionPhase::Disconnected("Broker disconnected".to_string())
        }
        (_, SessionEvent::Offline) => SessionPhase::Disconnected("Offline".to_string()),
        _ => current.clone(),
    }
}

/// Retry timing for the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Give up on an attempt that has not seen ConnAck after this long
    pub attempt_timeout: Duration,
    /// Delay before retrying after the attempt timer fired
    pub timeout_retry_delay: Duration,
    /// Delay before retrying after a ConnAck-timeout transport error
    pub ack_timeout_retry_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_max_exponent: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectSection::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectSection) -> Self {
        Self {
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            timeout_retry_delay: Duration::from_millis(config.timeout_retry_delay_ms),
            ack_timeout_retry_delay: Duration::from_millis(config.ack_timeout_retry_delay_ms),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            backoff_max_exponent: config.backoff_max_exponent,
        }
    }

    /// Delay after a session could not be set up at all:
    /// `min(max, base * 2^min(successful_connects, max_exponent))`
    pub fn setup_backoff(&self, successful_connects: u32) -> Duration {
        let exponent = successful_connects.min(self.backoff_max_exponent);
        let factor = 2u32.saturating_pow(exponent);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Retry delay owed to a transport error, if that kind of error is retried
    pub fn retry_after(&self, kind: TransportErrorKind) -> Option<Duration> {
        match kind {
            TransportErrorKind::ConnAckTimeout => Some(self.ack_timeout_retry_delay),
            TransportErrorKind::ConnectionRefused | TransportErrorKind::Other => None,
        }
    }
}

/// How the manager reacts to a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Broker never answered CONNECT; rotate endpoints and retry
    ConnAckTimeout,
    /// Broker answered with a refusal; usually bad credentials
    ConnectionRefused,
    Other,
}

/// Classify a transport error message (pure function, case-insensitive)
///
/// Only a broker refusal, rendered as `Connection refused: <code>`, counts as
/// refused. A socket-level `ECONNREFUSED` carried inside an I/O error is a
/// plain network failure.
pub fn classify_transport_error(message: &str) -> TransportErrorKind {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("connack timeout") {
        TransportErrorKind::ConnAckTimeout
    } else if lowered.starts_with("connection refused:") {
        TransportErrorKind::ConnectionRefused
    } else {
        TransportErrorKind::Other
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported broker scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("No broker endpoints configured")]
    NoEndpoints,
    #[error("Not connected - current phase: {phase:?}")]
    NotConnected { phase: SessionPhase },
}

/// Fresh client identifier for one connection attempt:
/// `bms_web_<epoch millis>_<9 random hex chars>`
pub fn generate_client_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let random = Uuid::new_v4().simple().to_string();
    format!("bms_web_{millis}_{}", &random[..9])
}

/// Build rumqttc options for one session request (pure function)
///
/// `mqtt`/`tcp` and `mqtts`/`ssl` connect over TCP; `ws`/`wss` use the
/// websocket transport, which takes the full URL as the broker address.
pub fn configure_mqtt_options(request: &SessionRequest) -> Result<MqttOptions, MqttError> {
    let address = &request.endpoint.address;
    let url = Url::parse(address).map_err(|_| MqttError::InvalidBrokerUrl(address.clone()))?;
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(address.clone()))?;

    let (broker, port, transport) = match url.scheme() {
        "mqtt" | "tcp" => (
            host.to_string(),
            url.port().unwrap_or(1883),
            RumqttcTransport::Tcp,
        ),
        "mqtts" | "ssl" => (
            host.to_string(),
            url.port().unwrap_or(8883),
            RumqttcTransport::tls_with_default_config(),
        ),
        "ws" => (
            address.clone(),
            url.port().unwrap_or(80),
            RumqttcTransport::Ws,
        ),
        "wss" => (
            address.clone(),
            url.port().unwrap_or(443),
            RumqttcTransport::wss_with_default_config(),
        ),
        other => return Err(MqttError::UnsupportedScheme(other.to_string())),
    };

    let mut mqtt_options = MqttOptions::new(request.client_id.clone(), broker, port);
    mqtt_options.set_transport(transport);
    mqtt_options.set_keep_alive(request.keep_alive);
    mqtt_options.set_clean_session(true);

    if let Some(credentials) = &request.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerEndpoint;
    use proptest::prelude::*;

    fn request_for(address: &str) -> SessionRequest {
        SessionRequest {
            id: 1,
            endpoint: BrokerEndpoint {
                name: "Test".to_string(),
                address: address.to_string(),
            },
            client_id: generate_client_id(),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(20),
        }
    }

    #[test]
    fn test_setup_backoff_schedule() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.setup_backoff(0), Duration::from_secs(3));
        assert_eq!(policy.setup_backoff(1), Duration::from_secs(6));
        assert_eq!(policy.setup_backoff(2), Duration::from_secs(12));
        assert_eq!(policy.setup_backoff(3), Duration::from_secs(24));
        // Exponent is capped at 3
        assert_eq!(policy.setup_backoff(4), Duration::from_secs(24));
        assert_eq!(policy.setup_backoff(u32::MAX), Duration::from_secs(24));
    }

    #[test]
    fn test_setup_backoff_respects_max() {
        let policy = ReconnectPolicy {
            backoff_base: Duration::from_secs(10),
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.setup_backoff(3), Duration::from_secs(30));
    }

    #[test]
    fn test_classify_transport_error() {
        assert_eq!(
            classify_transport_error("connack timeout: broker did not answer"),
            TransportErrorKind::ConnAckTimeout
        );
        assert_eq!(
            classify_transport_error("CONNACK TIMEOUT"),
            TransportErrorKind::ConnAckTimeout
        );
        assert_eq!(
            classify_transport_error("Connection refused: BadUserNamePassword"),
            TransportErrorKind::ConnectionRefused
        );
        assert_eq!(
            classify_transport_error("I/O: broken pipe"),
            TransportErrorKind::Other
        );
    }

    #[test]
    fn test_socket_refusal_is_not_a_broker_refusal() {
        assert_eq!(
            classify_transport_error("I/O: Connection refused (os error 111)"),
            TransportErrorKind::Other
        );
        assert_eq!(
            classify_transport_error("connection refused: NotAuthorized"),
            TransportErrorKind::ConnectionRefused
        );
    }

    #[test]
    fn test_only_connack_timeout_is_retried() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.retry_after(TransportErrorKind::ConnAckTimeout),
            Some(Duration::from_secs(3))
        );
        assert_eq!(policy.retry_after(TransportErrorKind::ConnectionRefused), None);
        assert_eq!(policy.retry_after(TransportErrorKind::Other), None);
    }

    #[test]
    fn test_next_phase_transitions() {
        let connecting = SessionPhase::Connecting(7);
        let connected = next_phase(&connecting, &SessionEvent::ConnAck);
        assert_eq!(connected, SessionPhase::Connected(7));

        // A second ConnAck changes nothing
        assert_eq!(next_phase(&connected, &SessionEvent::ConnAck), connected);

        let errored = next_phase(&connected, &SessionEvent::Error("boom".to_string()));
        assert_eq!(errored, SessionPhase::Errored("boom".to_string()));
        // Close after an error keeps the error visible
        assert_eq!(next_phase(&errored, &SessionEvent::Closed), errored);

        assert!(matches!(
            next_phase(&connected, &SessionEvent::Offline),
            SessionPhase::Disconnected(_)
        ));
        assert_eq!(next_phase(&connected, &SessionEvent::Subscribed), connected);
    }

    #[test]
    fn test_phase_activity() {
        assert!(!SessionPhase::Idle.is_active());
        assert!(SessionPhase::Connecting(1).is_active());
        assert!(SessionPhase::Connected(1).is_active());
        assert!(!SessionPhase::TimedOut.is_active());
        assert!(!SessionPhase::Errored("x".to_string()).is_active());
        assert!(SessionPhase::Connected(4).is_connected());
        assert!(!SessionPhase::Connecting(4).is_connected());
    }

    #[test]
    fn test_client_id_shape() {
        let id = generate_client_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "bms");
        assert_eq!(parts[1], "web");
        assert!(parts[2].parse::<u128>().is_ok());
        assert_eq!(parts[3].len(), 9);
        assert_ne!(id, generate_client_id());
    }

    #[test]
    fn test_configure_mqtt_options() {
        for address in [
            "mqtt://localhost:1883",
            "tcp://localhost",
            "ws://localhost:8080/mqtt",
        ] {
            let options = configure_mqtt_options(&request_for(address));
            assert!(options.is_ok(), "{address} should be accepted");
        }

        let options = configure_mqtt_options(&request_for("mqtt://broker.local")).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));

        let options = configure_mqtt_options(&request_for("ws://broker.local:9001/mqtt")).unwrap();
        assert_eq!(
            options.broker_address(),
            ("ws://broker.local:9001/mqtt".to_string(), 9001)
        );
    }

    #[test]
    fn test_invalid_broker_url() {
        let result = configure_mqtt_options(&request_for("invalid-url"));
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));

        let result = configure_mqtt_options(&request_for("http://localhost:1883"));
        assert!(matches!(result, Err(MqttError::UnsupportedScheme(s)) if s == "http"));
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::UnsupportedScheme("http".to_string()),
            MqttError::NoEndpoints,
            MqttError::NotConnected {
                phase: SessionPhase::Idle,
            },
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }

        let error = MqttError::PublishFailed("request queue full".into());
        assert_eq!(error.to_string(), "Publishing failed: request queue full");
    }

    proptest! {
        #[test]
        fn setup_backoff_never_exceeds_max(attempts in any::<u32>()) {
            let policy = ReconnectPolicy::default();
            let delay = policy.setup_backoff(attempts);
            prop_assert!(delay <= policy.backoff_max);
            prop_assert!(delay >= policy.backoff_base);
        }
    }
}
