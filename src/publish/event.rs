//! Outcome and event types handed to publish handlers

use crate::error::PublishError;
use serde::Serialize;

/// Event passed to the success handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    topic: String,
}

impl PublishEvent {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            event_type: "publish",
            topic: topic.into(),
        }
    }

    pub fn event_type(&self) -> &str {
        self.event_type
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Event passed to the failure handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    message: String,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            event_type: "error",
            message: message.into(),
        }
    }

    pub fn event_type(&self) -> &str {
        self.event_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NotConnected,
    Timeout,
    /// Transport reported an error after the wait completed
    ProtocolError(String),
}

impl FailureReason {
    /// Human readable reason carried by the error event
    pub fn message(&self) -> String {
        match self {
            FailureReason::NotConnected => PublishError::NotConnected.to_string(),
            FailureReason::Timeout => PublishError::Timeout.to_string(),
            FailureReason::ProtocolError(message) => message.clone(),
        }
    }
}

impl From<FailureReason> for PublishError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::NotConnected => PublishError::NotConnected,
            FailureReason::Timeout => PublishError::Timeout,
            FailureReason::ProtocolError(message) => PublishError::protocol(message),
        }
    }
}

/// Result of one publish, produced exactly once per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Success { topic: String },
    Failure { reason: FailureReason },
}

impl PublishOutcome {
    pub fn failure(reason: FailureReason) -> Self {
        PublishOutcome::Failure { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PublishOutcome::Success { .. })
    }
}
