//! Thread-safe metrics collection system
//!
//! Provides atomic counters and a mutex-protected latency window for tracking
//! the broker link, inbound telemetry and outbound commands.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Connect latencies kept for percentile calculation
const LATENCY_WINDOW: usize = 256;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Broker link
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_timeouts: AtomicU64,
    setup_failures: AtomicU64,
    transport_errors: AtomicU64,
    connection_start_time: AtomicU64,
    health_check_reconnects: AtomicU64,

    // Inbound messages
    messages_accepted: AtomicU64,
    messages_dropped: AtomicU64,
    last_message_at: AtomicU64,

    // Outbound commands
    commands_sent: AtomicU64,
    commands_rate_limited: AtomicU64,
    commands_rejected_offline: AtomicU64,
    publish_failures: AtomicU64,

    // Time from opening a session to ConnAck, in milliseconds
    connect_latencies: Mutex<Vec<u64>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_timeouts: AtomicU64::new(0),
            setup_failures: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            health_check_reconnects: AtomicU64::new(0),
            messages_accepted: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            last_message_at: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            commands_rate_limited: AtomicU64::new(0),
            commands_rejected_offline: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            connect_latencies: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Broker link metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self, latency: Duration) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
        self.record_connect_latency(latency);
    }

    pub fn mqtt_connection_timeout(&self) {
        self.connection_timeouts.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connection_lost();
    }

    pub fn mqtt_setup_failed(&self) {
        self.setup_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connection_lost();
    }

    pub fn mqtt_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connection_lost();
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn health_check_reconnect(&self) {
        self.health_check_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connect_latency(&self, latency: Duration) {
        if let Ok(mut latencies) = self.connect_latencies.lock() {
            latencies.push(latency.as_millis() as u64);

            if latencies.len() > LATENCY_WINDOW {
                latencies.remove(0);
            }
        }
    }

    // Inbound message metrics
    pub fn message_accepted(&self) {
        self.messages_accepted.fetch_add(1, Ordering::Relaxed);
        self.last_message_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Command metrics
    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rate_limited(&self) {
        self.commands_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected_offline(&self) {
        self.commands_rejected_offline
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_timeouts,
            &self.setup_failures,
            &self.transport_errors,
            &self.connection_start_time,
            &self.health_check_reconnects,
            &self.messages_accepted,
            &self.messages_dropped,
            &self.last_message_at,
            &self.commands_sent,
            &self.commands_rate_limited,
            &self.commands_rejected_offline,
            &self.publish_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut latencies) = self.connect_latencies.lock() {
            latencies.clear();
        }
    }

    /// Average and percentiles of connect latency (pure function)
    fn calculate_latency_statistics(&self) -> (f64, f64, f64) {
        let Ok(latencies) = self.connect_latencies.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_connect_ms, p50, p95) = self.calculate_latency_statistics();

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_timeouts: self.connection_timeouts.load(Ordering::Relaxed),
                setup_failures: self.setup_failures.load(Ordering::Relaxed),
                transport_errors: self.transport_errors.load(Ordering::Relaxed),
                health_check_reconnects: self.health_check_reconnects.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
                avg_connect_latency_ms: avg_connect_ms,
                connect_latency_p50_ms: p50,
                connect_latency_p95_ms: p95,
            },
            messages: MessageMetrics {
                accepted: self.messages_accepted.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                last_message_at: self.last_message_at.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                sent: self.commands_sent.load(Ordering::Relaxed),
                rate_limited: self.commands_rate_limited.load(Ordering::Relaxed),
                rejected_offline: self.commands_rejected_offline.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub messages: MessageMetrics,
    pub commands: CommandMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_timeouts: u64,
    pub setup_failures: u64,
    pub transport_errors: u64,
    pub health_check_reconnects: u64,
    pub connection_duration_seconds: u64,
    pub avg_connect_latency_ms: f64,
    pub connect_latency_p50_ms: f64,
    pub connect_latency_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct MessageMetrics {
    pub accepted: u64,
    pub dropped: u64,
    /// Epoch seconds of the last accepted message, 0 if none
    pub last_message_at: u64,
}

#[derive(Debug, Serialize)]
pub struct CommandMetrics {
    pub sent: u64,
    pub rate_limited: u64,
    pub rejected_offline: u64,
    pub publish_failures: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}
