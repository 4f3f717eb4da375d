//! rumqttc-backed broker sessions
//!
//! Each session owns its own `AsyncClient` and a spawned task polling the
//! event loop. The transport's own reconnect is never used: after the first
//! event-loop error the task reports it and stops, and the connection manager
//! decides what happens next.

use super::connection::{configure_mqtt_options, MqttError};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{BrokerSession, Connector, EventSink, SessionEvent, SessionRequest};
use rumqttc::{AsyncClient, EventLoop, NetworkOptions, QoS, SubscribeFilter};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Request queue capacity handed to rumqttc
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Opens rumqttc sessions
#[derive(Debug, Clone, Default)]
pub struct RumqttConnector;

impl RumqttConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for RumqttConnector {
    fn open(
        &self,
        request: SessionRequest,
        sink: EventSink,
    ) -> Result<Box<dyn BrokerSession>, MqttError> {
        let mqtt_options = configure_mqtt_options(&request)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(request.connect_timeout.as_secs().max(1));
        event_loop.set_network_options(network_options);

        debug!(
            target: "mqtt_transport",
            session = request.id,
            client_id = %request.client_id,
            endpoint = %request.endpoint.name,
            "Opening MQTT session"
        );

        let poll_task = tokio::spawn(drive_event_loop(event_loop, sink));

        Ok(Box::new(RumqttSession {
            client,
            poll_task: Some(poll_task),
        }))
    }
}

/// Poll the event loop until the session ends or the manager goes away
async fn drive_event_loop(mut event_loop: EventLoop, sink: EventSink) {
    let session = sink.session();
    let mut acknowledged = false;

    loop {
        match event_loop.poll().await {
            Ok(event) => {
                let route = MessageHandler::route_mqtt_event(&event);
                match &route {
                    EventRoute::ConnectionAcknowledged => acknowledged = true,
                    EventRoute::InfrastructureEvent(detail) => {
                        trace!(target: "mqtt_transport", session, "MQTT event: {}", detail);
                    }
                    _ => {}
                }

                let Some(session_event) = route.into_session_event() else {
                    continue;
                };
                let broker_disconnect = session_event == SessionEvent::Disconnected;
                if !sink.emit(session_event) {
                    debug!(
                        target: "mqtt_transport",
                        session,
                        "Connection manager gone, stopping session"
                    );
                    return;
                }
                if broker_disconnect {
                    info!(target: "mqtt_transport", session, "Broker closed the session");
                    sink.emit(SessionEvent::Closed);
                    return;
                }
            }
            Err(e) => {
                let message = MessageHandler::describe_connection_error(&e, acknowledged);
                error!(
                    target: "mqtt_transport",
                    session,
                    error = %message,
                    "MQTT event loop error"
                );

                sink.emit(SessionEvent::Error(message));
                if acknowledged && MessageHandler::is_network_loss(&e) {
                    sink.emit(SessionEvent::Offline);
                }
                sink.emit(SessionEvent::Closed);
                return;
            }
        }
    }
}

/// Live rumqttc session
pub struct RumqttSession {
    client: AsyncClient,
    poll_task: Option<JoinHandle<()>>,
}

impl BrokerSession for RumqttSession {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), MqttError> {
        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce))
            .collect::<Vec<_>>();
        self.client
            .try_subscribe_many(filters)
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    fn close(&mut self) {
        if let Some(handle) = self.poll_task.take() {
            // Best effort; the poll task is aborted regardless
            let _ = self.client.try_disconnect();
            handle.abort();
        }
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.close();
    }
}
