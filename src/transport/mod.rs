//! Transport layer for publishing
//!
//! This module provides the publish client abstraction the bridge talks to
//! and the rumqttc-backed MQTT implementation of it.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;

pub mod mqtt;
pub mod token;

pub use token::{CompletionToken, TokenCompleter};

/// Connected protocol client as seen by the publish bridge
///
/// Implementations must be safe for concurrent use: several publishes may be
/// in flight at once, each waited on from its own background task.
pub trait PublishClient: Send + Sync {
    /// Check if the client can currently publish
    fn is_connected(&self) -> bool;

    /// Enqueue a publish without blocking and hand back its completion token
    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Bytes) -> CompletionToken;
}

/// Map a numeric QoS level onto the protocol type
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
