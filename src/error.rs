//! Error taxonomy for publish operations
//!
//! Every way a publish can fail maps to one [`PublishError`] variant. The same
//! value is both returned to the caller and, at the embedding boundary,
//! raised into the script as a pending exception (see [`crate::vu::Vu::throw`]).

use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by user supplied success/failure handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for publish operations
///
/// Cloneable so one failure can be both raised into the script and returned.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("publish not connected")]
    NotConnected,

    #[error("publish timeout value {millis}ms is too long")]
    TimeoutValueInvalid { millis: u64 },

    #[error("publish timeout")]
    Timeout,

    #[error("publish failed: {message}")]
    ProtocolError { message: String },

    #[error("invalid qos level {level}, expected 0, 1 or 2")]
    InvalidQos { level: u8 },

    #[error("execution state unavailable, environment is shutting down")]
    StateUnavailable,

    #[error("publish handler failed: {0}")]
    HandlerError(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

    #[error("callback slot {slot} was dropped without delivering an outcome")]
    CallbackDropped { slot: u64 },

    #[error("publisher needs a multi-thread tokio runtime, got {flavor}")]
    UnsupportedRuntime { flavor: String },
}

impl PublishError {
    /// Create protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    /// Create handler error from anything convertible into a boxed error
    pub fn handler<E: Into<HandlerError>>(error: E) -> Self {
        Self::HandlerError(Arc::from(error.into()))
    }
}

/// Result type for publish operations
pub type PublishResult<T> = Result<T, PublishError>;
