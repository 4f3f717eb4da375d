//! Topic name validation for the BMS topics
//!
//! The dashboard only ever subscribes and publishes to exact topic names, so
//! wildcard characters are rejected along with the other names MQTT forbids.

use thiserror::Error;

/// Maximum encoded length of an MQTT topic name
pub const MAX_TOPIC_LEN: usize = 65_535;

pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong(topic.len()));
    }

    for ch in topic.chars() {
        if ch == '+' || ch == '#' {
            return Err(ValidationError::WildcardInTopic(ch));
        }
        if ch == '\0' {
            return Err(ValidationError::NullCharacter);
        }
    }

    Ok(())
}

/// Validation errors for topic names
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic is {0} bytes, longer than the MQTT limit")]
    TopicTooLong(usize),
    #[error("Topic contains wildcard character: '{0}'")]
    WildcardInTopic(char),
    #[error("Topic contains a NUL character")]
    NullCharacter,
}
