//! Pure message routing and processing logic for MQTT events
//!
//! [`MessageHandler`] turns rumqttc events and errors into session events.
//! [`MessageRouter`] decides what an inbound publish means for the dashboard
//! state and applies it.

use crate::config::{TelemetrySection, TopicsSection};
use crate::observability::metrics::metrics;
use crate::protocol::{BmsTelemetry, DeviceStatus};
use crate::state::{SharedState, Snapshot};
use crate::transport::SessionEvent;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::{ConnectionError, Event, Packet, SubscribeReasonCode};
use tracing::{debug, warn};

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: suback.return_codes.clone(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(
        return_codes: &[SubscribeReasonCode],
    ) -> Result<(), String> {
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }

    /// Render an event-loop error as the text carried by [`SessionEvent::Error`]
    ///
    /// A network timeout before the broker acknowledged the session is the
    /// broker failing to answer CONNECT, reported as a ConnAck timeout.
    pub fn describe_connection_error(error: &ConnectionError, acknowledged: bool) -> String {
        match error {
            ConnectionError::NetworkTimeout if !acknowledged => {
                "connack timeout: broker did not acknowledge the connection".to_string()
            }
            ConnectionError::ConnectionRefused(code) => format!("Connection refused: {code:?}"),
            other => other.to_string(),
        }
    }

    /// True when the error means the network itself dropped
    pub fn is_network_loss(error: &ConnectionError) -> bool {
        matches!(
            error,
            ConnectionError::Io(_) | ConnectionError::NetworkTimeout
        )
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<SubscribeReasonCode>,
    },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

impl EventRoute {
    /// Session event to raise for this route, if any
    pub fn into_session_event(self) -> Option<SessionEvent> {
        match self {
            EventRoute::ConnectionAcknowledged => Some(SessionEvent::ConnAck),
            EventRoute::MessageReceived { topic, payload } => {
                Some(SessionEvent::Message { topic, payload })
            }
            EventRoute::Disconnected => Some(SessionEvent::Disconnected),
            EventRoute::SubscriptionConfirmed { return_codes, .. } => Some(
                match MessageHandler::validate_subscription_success(&return_codes) {
                    Ok(()) => SessionEvent::Subscribed,
                    Err(reason) => SessionEvent::SubscribeFailed(reason),
                },
            ),
            EventRoute::InfrastructureEvent(_) | EventRoute::OutgoingEvent => None,
        }
    }
}

/// Decoded inbound record
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRecord {
    Telemetry(BmsTelemetry),
    SystemStatus(DeviceStatus),
}

/// Why an inbound publish was not applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Payload larger than the configured bound (actual size)
    Oversized(usize),
    /// Topic is neither the data nor the status topic
    UnknownTopic,
    /// Payload is not valid JSON for the topic's record type
    Malformed(String),
}

/// Outcome of routing one inbound publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Telemetry,
    SystemStatus,
    Dropped(Rejection),
}

/// Applies inbound publishes to the shared state
///
/// Only a publish on a known topic that parses replaces a snapshot and bumps
/// `messages_received`; everything else is logged and dropped.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    data_topic: String,
    status_topic: String,
    max_payload_bytes: usize,
    state: SharedState,
}

impl MessageRouter {
    pub fn new(topics: &TopicsSection, telemetry: &TelemetrySection, state: SharedState) -> Self {
        Self {
            data_topic: topics.data.clone(),
            status_topic: topics.status.clone(),
            max_payload_bytes: telemetry.max_payload_bytes,
            state,
        }
    }

    /// Decode a publish without touching state (pure function)
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<InboundRecord, Rejection> {
        if payload.len() > self.max_payload_bytes {
            return Err(Rejection::Oversized(payload.len()));
        }

        if topic == self.data_topic {
            serde_json::from_slice::<BmsTelemetry>(payload)
                .map(InboundRecord::Telemetry)
                .map_err(|e| Rejection::Malformed(e.to_string()))
        } else if topic == self.status_topic {
            serde_json::from_slice::<DeviceStatus>(payload)
                .map(InboundRecord::SystemStatus)
                .map_err(|e| Rejection::Malformed(e.to_string()))
        } else {
            Err(Rejection::UnknownTopic)
        }
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        self.route_at(topic, payload, Utc::now())
    }

    /// Route with an explicit arrival time
    pub fn route_at(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> RouteOutcome {
        match self.decode(topic, payload) {
            Ok(InboundRecord::Telemetry(record)) => {
                self.state
                    .replace_telemetry(Snapshot::new(record, received_at));
                metrics().message_accepted();
                RouteOutcome::Telemetry
            }
            Ok(InboundRecord::SystemStatus(record)) => {
                self.state
                    .replace_system_status(Snapshot::new(record, received_at));
                metrics().message_accepted();
                RouteOutcome::SystemStatus
            }
            Err(rejection) => {
                match &rejection {
                    Rejection::Oversized(size) => {
                        warn!(
                            target: "mqtt_transport",
                            topic = %topic,
                            size,
                            limit = self.max_payload_bytes,
                            "Dropping oversized MQTT message"
                        );
                    }
                    Rejection::Malformed(reason) => {
                        warn!(
                            target: "mqtt_transport",
                            topic = %topic,
                            %reason,
                            "Dropping malformed MQTT message"
                        );
                    }
                    Rejection::UnknownTopic => {
                        debug!(
                            target: "mqtt_transport",
                            topic = %topic,
                            "Ignoring message on unexpected topic"
                        );
                    }
                }
                metrics().message_dropped();
                RouteOutcome::Dropped(rejection)
            }
        }
    }
}
