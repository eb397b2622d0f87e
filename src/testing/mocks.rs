//! Mock implementations for testing
//!
//! Provides a [`MockClient`] standing in for a broker connection so the
//! publish bridge can be exercised without an MQTT broker.

use crate::transport::{CompletionToken, PublishClient};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A publish as the mock transport received it
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

/// Mock publish client with configurable connectivity, ack latency and failure
#[derive(Debug)]
pub struct MockClient {
    connected: AtomicBool,
    ack_delay: Duration,
    failure: Option<String>,
    published: Mutex<Vec<PublishedMessage>>,
    discarded: Arc<AtomicUsize>,
}

impl MockClient {
    fn with_connected(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            ack_delay: Duration::ZERO,
            failure: None,
            published: Mutex::new(Vec::new()),
            discarded: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connected() -> Self {
        Self::with_connected(true)
    }

    pub fn disconnected() -> Self {
        Self::with_connected(false)
    }

    /// Acknowledge each publish after `delay` instead of immediately.
    /// Delayed acks need a tokio runtime at publish time.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// Complete every publish with this transport error
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn publish_count(&self) -> usize {
        self.published().len()
    }

    /// Completions that arrived after their waiter had given up
    pub fn discarded_completions(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }
}

impl PublishClient for MockClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Bytes) -> CompletionToken {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                qos,
                retain,
                payload,
            });

        let result = match &self.failure {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        };

        if self.ack_delay.is_zero() {
            return CompletionToken::completed(result.err());
        }

        let (completer, token) = CompletionToken::pending();
        let delay = self.ack_delay;
        let discarded = self.discarded.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !completer.complete(result) {
                discarded.fetch_add(1, Ordering::SeqCst);
            }
        });
        token
    }
}
