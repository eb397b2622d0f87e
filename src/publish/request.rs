//! Publish request validation
//!
//! Pure functions only: nothing here touches the network or the VU.

use crate::error::{PublishError, PublishResult};
use crate::transport::qos_from_level;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::time::Duration;

/// Largest timeout whose nanosecond count fits a signed 64-bit integer
pub const MAX_TIMEOUT_MILLIS: u64 = (i64::MAX as u64) / 1_000_000;

/// One message to publish, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    topic: String,
    qos: QoS,
    payload: Bytes,
    retain: bool,
    timeout_millis: u64,
}

impl PublishRequest {
    /// Build a request from raw caller input.
    ///
    /// Only the QoS level is checked here; the timeout is range-checked when
    /// the publish runs so each path can report it the way it must.
    pub fn new(
        topic: impl Into<String>,
        qos: u8,
        payload: impl Into<Bytes>,
        retain: bool,
        timeout_millis: u64,
    ) -> PublishResult<Self> {
        let qos = qos_from_level(qos).ok_or(PublishError::InvalidQos { level: qos })?;
        Ok(Self {
            topic: topic.into(),
            qos,
            payload: payload.into(),
            retain,
            timeout_millis,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn timeout_millis(&self) -> u64 {
        self.timeout_millis
    }
}

/// Convert a caller supplied millisecond timeout into a wait duration.
///
/// Fails with [`PublishError::TimeoutValueInvalid`] when the value does not
/// fit a signed nanosecond count.
pub fn wait_duration(millis: u64) -> PublishResult<Duration> {
    i64::try_from(millis)
        .ok()
        .and_then(|ms| ms.checked_mul(1_000_000))
        .and_then(|nanos| u64::try_from(nanos).ok())
        .map(Duration::from_nanos)
        .ok_or(PublishError::TimeoutValueInvalid { millis })
}
