//! Top-level error type for the BMS monitor
//!
//! Connection-level failures never surface here: the connection manager
//! reports them through [`crate::state::ConnectionStatus`] and notifications.
//! This type covers start-up problems and invalid requests from callers.

use crate::config::ConfigError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Longest error text shown to a dashboard user
const MAX_USER_MESSAGE_LEN: usize = 200;

/// Main error type for monitor operations
#[derive(Debug, Error)]
pub enum BmsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },

    #[error("Health server error: {message}")]
    HealthServer { message: String },
}

impl BmsError {
    pub fn unknown_command<S: Into<String>>(command: S) -> Self {
        Self::UnknownCommand {
            command: command.into(),
        }
    }

    /// Short text suitable for a notification or status line
    pub fn user_message(&self) -> String {
        truncate_message(&self.to_string())
    }
}

/// Cap a message at a char boundary so it fits a notification
pub(crate) fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_USER_MESSAGE_LEN {
        return message.to_string();
    }

    let suffix = "...";
    let mut end = MAX_USER_MESSAGE_LEN - suffix.len();
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{suffix}", &message[..end])
}

/// Result type for monitor operations
pub type BmsResult<T> = Result<T, BmsError>;
