//! Connection manager behaviour against a scripted broker
//!
//! Time is paused so connect timeouts and retry delays can be stepped
//! through deterministically.

use bmslink::config::{BrokerEndpoint, MonitorConfig};
use bmslink::state::{Severity, SharedState};
use bmslink::testing::mocks::{MockConnector, MockSessionHandle};
use bmslink::transport::mqtt::{ConnectionManager, ManagerSettings, SessionPhase};
use bmslink::transport::SessionEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::advance;

use test_helpers::{settle, test_config};

struct Harness {
    manager: ConnectionManager,
    connector: MockConnector,
    state: SharedState,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: MonitorConfig) -> Self {
        let connector = MockConnector::new();
        let state = SharedState::new();
        let manager = ConnectionManager::new(
            ManagerSettings::from_config(&config),
            Arc::new(connector.clone()),
            state.clone(),
        )
        .expect("manager should build");

        Self {
            manager,
            connector,
            state,
        }
    }

    fn session(&self) -> MockSessionHandle {
        self.connector.last_session().expect("a session was opened")
    }

    /// Connect and acknowledge, leaving the manager connected
    async fn connected(&self) -> MockSessionHandle {
        self.manager.connect();
        let session = self.session();
        session.ack();
        settle().await;
        assert!(self.manager.is_connected());
        session
    }
}

fn three_endpoints() -> MonitorConfig {
    let mut config = test_config();
    config.broker.endpoints.push(BrokerEndpoint {
        name: "Tertiary".to_string(),
        address: "mqtts://backup.example.com:8883".to_string(),
    });
    config
}

#[tokio::test(start_paused = true)]
async fn test_connack_marks_connected_and_subscribes() {
    let harness = Harness::new();

    harness.manager.connect();
    assert!(harness.state.connection_status().is_reconnecting);

    let session = harness.session();
    assert_eq!(session.request.endpoint.name, "Primary");
    assert!(session.request.client_id.starts_with("bms_web_"));

    session.ack();
    settle().await;

    let status = harness.state.connection_status();
    assert!(status.is_connected);
    assert!(!status.is_reconnecting);
    assert_eq!(status.reconnect_attempts, 1);
    assert_eq!(status.last_error, None);
    assert_eq!(
        session.subscriptions(),
        vec![vec!["bms/data".to_string(), "bms/status".to_string()]]
    );
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_connect_then_telemetry() {
    let harness = Harness::new();
    assert!(!harness.state.connection_status().is_connected);

    let session = harness.connected().await;
    let status = harness.state.connection_status();
    assert!(status.is_connected);
    assert!(!status.is_reconnecting);
    assert_eq!(status.reconnect_attempts, 1);

    session.message("bms/data", r#"{"pack_voltage":52.3,"soc":80}"#);
    settle().await;

    let snapshot = harness.state.telemetry().expect("telemetry stored");
    assert_eq!(snapshot.record.pack_voltage, Some(52.3));
    assert_eq!(snapshot.record.soc, Some(80.0));
    assert_eq!(harness.state.connection_status().messages_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_is_replaced_not_merged() {
    let harness = Harness::new();
    let session = harness.connected().await;

    session.message("bms/data", r#"{"pack_voltage":52.3,"soc":80}"#);
    session.message("bms/data", r#"{"current":-3.5}"#);
    settle().await;

    let snapshot = harness.state.telemetry().unwrap();
    assert_eq!(snapshot.record.current, Some(-3.5));
    assert_eq!(snapshot.record.pack_voltage, None);
    assert_eq!(snapshot.record.soc, None);
    assert_eq!(harness.state.connection_status().messages_received, 2);
}

#[tokio::test(start_paused = true)]
async fn test_bad_messages_leave_state_untouched() {
    let harness = Harness::new();
    let session = harness.connected().await;

    session.message("bms/status", r#"{"wifi_rssi":-61}"#);
    settle().await;
    let before = harness.state.connection_status().messages_received;

    session.message("bms/data", vec![b' '; 4096]);
    session.message("bms/data", "{not json");
    session.message("bms/status", "[1, 2");
    session.message("bms/unknown", r#"{"soc":1}"#);
    settle().await;

    assert!(harness.state.telemetry().is_none());
    assert_eq!(
        harness.state.system_status().unwrap().record.wifi_rssi,
        Some(-61.0)
    );
    assert_eq!(harness.state.connection_status().messages_received, before);
}

#[tokio::test(start_paused = true)]
async fn test_credentials_are_read_on_every_attempt() {
    let mut config = test_config();
    config.broker.username_env = Some("BMSLINK_TEST_ROTATING_USER".to_string());
    config.broker.password_env = Some("BMSLINK_TEST_ROTATING_PASS".to_string());
    std::env::remove_var("BMSLINK_TEST_ROTATING_USER");
    std::env::remove_var("BMSLINK_TEST_ROTATING_PASS");
    let harness = Harness::with_config(config);

    harness.manager.connect();
    assert!(harness.session().request.credentials.is_none());
    harness.manager.disconnect();

    std::env::set_var("BMSLINK_TEST_ROTATING_USER", "dashboard");
    std::env::set_var("BMSLINK_TEST_ROTATING_PASS", "rotated");
    harness.manager.connect();
    let credentials = harness.session().request.credentials.clone().unwrap();
    assert_eq!(credentials.username, "dashboard");
    assert_eq!(credentials.password, "rotated");

    std::env::remove_var("BMSLINK_TEST_ROTATING_USER");
    std::env::remove_var("BMSLINK_TEST_ROTATING_PASS");
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_is_noop() {
    let harness = Harness::new();
    harness.connected().await;
    let status_before = harness.state.connection_status();

    harness.manager.connect();
    harness.manager.connect();
    settle().await;

    assert_eq!(harness.connector.open_count(), 1);
    assert_eq!(harness.state.connection_status(), status_before);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connecting_is_noop() {
    let harness = Harness::new();

    harness.manager.connect();
    harness.manager.connect();

    assert_eq!(harness.connector.open_count(), 1);
    assert_eq!(harness.manager.phase(), SessionPhase::Connecting(1));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_rotates_and_retries() {
    let harness = Harness::new();
    harness.manager.connect();
    let first = harness.session();

    advance(Duration::from_secs(25)).await;
    settle().await;

    assert!(first.is_closed());
    assert_eq!(harness.manager.endpoint_index(), 1);
    let status = harness.state.connection_status();
    assert!(!status.is_reconnecting);
    assert_eq!(status.last_error.as_deref(), Some("Timeout with Primary"));
    assert_eq!(harness.connector.open_count(), 1);

    advance(Duration::from_secs(2)).await;
    settle().await;

    assert_eq!(harness.connector.open_count(), 2);
    assert_eq!(harness.session().request.endpoint.name, "Secondary");
    assert!(harness.state.connection_status().is_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_connack_cancels_attempt_timer() {
    let harness = Harness::new();
    harness.manager.connect();

    advance(Duration::from_secs(20)).await;
    harness.session().ack();
    settle().await;

    advance(Duration::from_secs(60)).await;
    settle().await;

    assert!(harness.manager.is_connected());
    assert_eq!(harness.connector.open_count(), 1);
    assert_eq!(harness.manager.endpoint_index(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rotation_index_is_n_mod_len_and_resets_on_connect() {
    let harness = Harness::with_config(three_endpoints());
    harness.manager.connect();

    for n in 1..=7usize {
        advance(Duration::from_secs(25)).await;
        settle().await;
        assert_eq!(harness.manager.endpoint_index(), n % 3, "after {n} timeouts");
        advance(Duration::from_secs(2)).await;
        settle().await;
    }

    assert_eq!(
        harness.connector.endpoint_history()[..4],
        ["Primary", "Secondary", "Tertiary", "Primary"]
    );

    harness.session().ack();
    settle().await;
    assert_eq!(harness.manager.endpoint_index(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connack_timeout_error_rotates_and_schedules_retry() {
    let harness = Harness::new();
    let session = harness.connected().await;
    let mut notifications = harness.state.notifications();

    session.error("connack timeout: broker did not acknowledge the connection");
    settle().await;

    assert_eq!(harness.manager.endpoint_index(), 1);
    let status = harness.state.connection_status();
    assert!(!status.is_connected);
    assert!(!status.is_reconnecting);
    assert!(status.last_error.unwrap().contains("connack timeout"));
    assert_eq!(notifications.recv().await.unwrap().title, "Connection timeout");

    // Nothing before the retry delay
    advance(Duration::from_millis(2999)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 1);

    advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 2);
    assert!(session.is_closed());
    assert_eq!(harness.session().request.endpoint.name, "Secondary");
}

#[tokio::test(start_paused = true)]
async fn test_other_errors_do_not_schedule_retry() {
    let harness = Harness::new();
    let session = harness.connected().await;
    let mut notifications = harness.state.notifications();

    session.error("Connection refused: BadUserNamePassword");
    settle().await;
    assert_eq!(
        notifications.recv().await.unwrap().description,
        "Check the broker credentials"
    );

    session.error("I/O: connection reset by peer");
    settle().await;

    advance(Duration::from_secs(120)).await;
    settle().await;

    assert_eq!(harness.connector.open_count(), 1);
    assert_eq!(harness.manager.endpoint_index(), 0);
    let status = harness.state.connection_status();
    assert!(!status.is_connected);
    assert_eq!(
        status.last_error.as_deref(),
        Some("I/O: connection reset by peer")
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_and_offline_update_status_without_retry() {
    let harness = Harness::new();
    let session = harness.connected().await;

    session.emit(SessionEvent::Offline);
    settle().await;
    let status = harness.state.connection_status();
    assert!(!status.is_connected);

    session.emit(SessionEvent::Closed);
    settle().await;
    let status = harness.state.connection_status();
    assert!(!status.is_connected);
    assert!(!status.is_reconnecting);

    advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 1);

    // An explicit connect starts over with a fresh session
    harness.manager.connect();
    assert_eq!(harness.connector.open_count(), 2);
    assert!(session.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_broker_disconnect_updates_status_without_retry() {
    let harness = Harness::new();
    let session = harness.connected().await;

    session.emit(SessionEvent::Disconnected);
    settle().await;

    let status = harness.state.connection_status();
    assert!(!status.is_connected);
    assert!(!status.is_reconnecting);
    assert!(matches!(
        harness.manager.phase(),
        SessionPhase::Disconnected(_)
    ));

    advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 1);
    assert_eq!(harness.manager.endpoint_index(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_suback_raises_info_naming_endpoint() {
    let harness = Harness::new();
    let session = harness.connected().await;
    let mut notifications = harness.state.notifications();

    session.emit(SessionEvent::Subscribed);
    settle().await;

    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification.severity, Severity::Info);
    assert_eq!(notification.title, "Connected");
    assert!(notification.description.contains("Primary"));
    assert_eq!(harness.state.connection_status().last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_socket_refusal_reports_plain_connection_error() {
    let harness = Harness::new();
    let session = harness.connected().await;
    let mut notifications = harness.state.notifications();

    session.error("I/O: Connection refused (os error 111)");
    settle().await;

    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification.title, "Connection error");
    assert!(notification.description.contains("os error 111"));

    advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_backs_off_exponentially() {
    let harness = Harness::new();
    harness.connector.fail_next_setups(2);

    harness.manager.connect();
    let status = harness.state.connection_status();
    assert!(!status.is_connected);
    assert!(!status.is_reconnecting);
    assert!(status.last_error.is_some());
    assert_eq!(harness.connector.open_count(), 0);

    // No successful connects yet: base delay of 3s
    advance(Duration::from_millis(2999)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 0);
    advance(Duration::from_millis(1)).await;
    settle().await;

    // Second failure, still 3s
    advance(Duration::from_secs(3)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 1);
    assert!(harness.state.connection_status().is_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_setup_backoff_grows_with_successful_connects() {
    let harness = Harness::new();
    let session = harness.connected().await;
    session.emit(SessionEvent::Closed);
    settle().await;

    harness.connector.fail_next_setups(1);
    harness.manager.connect();
    assert_eq!(harness.connector.open_count(), 1);

    // One successful connect so far: 3s * 2^1
    advance(Duration::from_millis(5999)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 1);
    advance(Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_events_from_superseded_session_are_ignored() {
    let harness = Harness::new();
    harness.manager.connect();
    let stale = harness.session();

    advance(Duration::from_secs(25)).await;
    settle().await;
    advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(harness.connector.open_count(), 2);

    stale.ack();
    stale.message("bms/data", r#"{"soc":10}"#);
    settle().await;

    assert!(!harness.manager.is_connected());
    assert!(harness.state.telemetry().is_none());
    assert_eq!(harness.state.connection_status().messages_received, 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_keeps_connection() {
    let harness = Harness::new();
    harness.manager.connect();
    let session = harness.session();
    session.fail_subscribe(true);
    let mut notifications = harness.state.notifications();

    session.ack();
    settle().await;

    let status = harness.state.connection_status();
    assert!(status.is_connected);
    assert!(status.last_error.unwrap().starts_with("Subscription failed"));
    let notification = notifications.recv().await.unwrap();
    assert_eq!(notification.severity, Severity::Error);

    advance(Duration::from_secs(1)).await;
    assert!(harness.manager.send_command("reset_bms", None));
}

#[tokio::test(start_paused = true)]
async fn test_send_command_gating() {
    let harness = Harness::new();

    // Not connected: nothing published
    assert!(!harness.manager.send_command("charge_enable", Some(true)));

    let session = harness.connected().await;

    assert!(harness.manager.send_command("charge_enable", None));
    // Rate limited even while connected
    assert!(!harness.manager.send_command("discharge_enable", Some(false)));

    advance(Duration::from_millis(1000)).await;
    assert!(harness.manager.send_command("discharge_enable", Some(false)));

    let published = session.published();
    assert_eq!(published.len(), 2);

    let (topic, payload) = &published[0];
    assert_eq!(topic, "bms/control");
    let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(body["command"], "charge_enable");
    assert_eq!(body["value"], true);
    assert!(body["timestamp"].as_i64().unwrap() > 0);

    let body: serde_json::Value = serde_json::from_slice(&published[1].1).unwrap();
    assert_eq!(body["value"], false);
}

#[tokio::test(start_paused = true)]
async fn test_publish_failure_returns_false_and_keeps_link() {
    let harness = Harness::new();
    let session = harness.connected().await;
    session.fail_publish(true);

    assert!(!harness.manager.send_command("reset_bms", None));
    assert!(harness.state.connection_status().is_connected);
    assert!(session.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_timers_and_closes_session() {
    let harness = Harness::new();
    harness.manager.connect();
    let session = harness.session();

    harness.manager.disconnect();
    assert!(session.is_closed());
    assert_eq!(harness.manager.phase(), SessionPhase::Idle);

    // The attempt timer was cancelled: no rotation, no retry
    advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(harness.manager.endpoint_index(), 0);
    assert_eq!(harness.connector.open_count(), 1);

    let status = harness.state.connection_status();
    assert!(!status.is_connected);
    assert!(!status.is_reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_retry() {
    let harness = Harness::new();
    let session = harness.connected().await;
    session.error("connack timeout");
    settle().await;

    harness.manager.disconnect();
    advance(Duration::from_secs(10)).await;
    settle().await;

    assert_eq!(harness.connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_manager_closes_session() {
    let harness = Harness::new();
    let session = harness.connected().await;

    drop(harness.manager);
    settle().await;

    assert!(session.is_closed());
    assert!(!session.ack());
}
