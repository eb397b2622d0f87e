//! Impure I/O operations for the MQTT client
//!
//! This module owns the rumqttc event loop: it drives the connection, turns
//! broker acknowledgments into token completions and replaces the connection
//! after failures.

use super::connection::{
    configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig, ReconnectionDecision,
};
use super::inflight::Inflight;
use crate::config::MqttSection;
use crate::transport::{CompletionToken, PublishClient};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason, PubCompReason, PubRecReason};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use rumqttc::Outgoing;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the request channel between client handles and the event loop
const REQUEST_CAPACITY: usize = 64;

/// How long `disconnect` waits for the event loop to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Client handle plus the tokens waiting on it, always swapped together
struct Session {
    client: AsyncClient,
    inflight: Inflight,
}

/// What the supervisor should do after handling one event
#[derive(Debug, PartialEq)]
enum EventAction {
    Continue,
    ConnectionLost(String),
    Stop,
}

/// MQTT transport client backing the publish bridge
pub struct MqttClient {
    config: MqttSection,
    session: Arc<Mutex<Session>>,
    /// Held until `connect` hands it to the supervisor
    event_loop: Mutex<Option<EventLoop>>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    reconnect_config: ReconnectConfig,
}

impl MqttClient {
    pub fn new(config: MqttSection) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(&config)?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);
        let reconnect_config = ReconnectConfig::from_section(&config);

        Ok(MqttClient {
            config,
            session: Arc::new(Mutex::new(Session {
                client,
                inflight: Inflight::new(),
            })),
            event_loop: Mutex::new(Some(event_loop)),
            event_loop_handle: None,
            state_tx,
            state_rx,
            shutdown_tx,
            reconnect_config,
        })
    }

    /// Override the reconnection policy derived from config
    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    /// Helper method to create new MQTT connection and event loop
    /// Used for initial connection and reconnection attempts
    fn create_connection(config: &MqttSection) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CAPACITY))
    }

    /// Connect to the broker and wait for ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(MqttError::AlreadyStarted)?;

        let supervisor = Supervisor {
            config: self.config.clone(),
            session: self.session.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            reconnect_config: self.reconnect_config.clone(),
        };
        let span = crate::connection_span!(broker = %self.config.broker_url);
        self.event_loop_handle = Some(tokio::spawn(supervisor.run(event_loop).instrument(span)));

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        if let Err(e) = Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await
        {
            let _ = self.shutdown_tx.send(true);
            return Err(e);
        }
        Ok(())
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    state @ ConnectionState::PermanentlyDisconnected(_) => {
                        return Err(MqttError::NotConnected {
                            state: state.clone(),
                        });
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Send DISCONNECT and stop the event loop
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        let client = self.lock_session().client.clone();
        let disconnect_result = client.disconnect().await;

        let _ = self.state_tx.send(ConnectionState::Disconnected(
            "Client disconnected".to_string(),
        ));

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing stop");
                    let _ = self.shutdown_tx.send(true);
                }
            }
        }

        disconnect_result.map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        info!("MQTT client disconnected");
        Ok(())
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Check if the connection is permanently disconnected
    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::PermanentlyDisconnected(_)
        )
    }

    /// Number of publishes handed to rumqttc that are not resolved yet
    pub fn inflight_count(&self) -> usize {
        self.lock_session().inflight.len()
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }
}

impl PublishClient for MqttClient {
    fn is_connected(&self) -> bool {
        self.state_rx.borrow().can_publish()
    }

    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Bytes) -> CompletionToken {
        // Enqueue and track under one lock so tracking order matches the
        // order requests reach the event loop
        let mut session = self.lock_session();
        let (completer, token) = CompletionToken::pending();

        match session.client.try_publish(topic, qos, retain, payload) {
            Ok(()) => session.inflight.enqueue(qos, completer),
            Err(e) => {
                warn!(topic = %topic, "MQTT client refused publish: {}", e);
                completer.fail(format!("publish rejected by client: {e}"));
            }
        }
        token
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    // A panic while holding the lock cannot leave the session half-updated in
    // a way that matters here, so keep going with the inner value
    session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Background task driving the rumqttc event loop
struct Supervisor {
    config: MqttSection,
    session: Arc<Mutex<Session>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
}

enum Step {
    Shutdown,
    Polled(Result<Event, ConnectionError>),
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(broker = %self.config.broker_url, "Starting MQTT event loop");
        let mut reconnect_attempts = 0u32;

        loop {
            let step = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        Step::Shutdown
                    } else {
                        continue;
                    }
                }
                polled = event_loop.poll() => Step::Polled(polled),
            };

            let action = match step {
                Step::Shutdown => {
                    info!("Shutdown signal received, stopping MQTT event loop");
                    EventAction::Stop
                }
                Step::Polled(Ok(event)) => self.handle_event(event, &mut reconnect_attempts),
                Step::Polled(Err(e)) => EventAction::ConnectionLost(e.to_string()),
            };

            match action {
                EventAction::Continue => {}
                EventAction::Stop => break,
                EventAction::ConnectionLost(reason) => {
                    match self.reconnect(&reason, &mut reconnect_attempts).await {
                        Some(new_event_loop) => event_loop = new_event_loop,
                        None => break,
                    }
                }
            }
        }

        let failed = lock(&self.session)
            .inflight
            .fail_all("client shutting down");
        if failed > 0 {
            debug!(failed, "Failed publishes still in flight at shutdown");
        }
        info!("MQTT event loop stopped");
    }

    fn handle_event(&self, event: Event, reconnect_attempts: &mut u32) -> EventAction {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("MQTT connection established");
                *reconnect_attempts = 0;
                let _ = self.state_tx.send(ConnectionState::Connected);
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                lock(&self.session)
                    .inflight
                    .on_ack(ack.pkid, puback_result(&ack.reason));
            }
            Event::Incoming(Packet::PubRec(rec)) => {
                // Success only means the broker has it; completion comes with PubComp
                if let Err(reason) = pubrec_result(&rec.reason) {
                    lock(&self.session).inflight.on_ack(rec.pkid, Err(reason));
                }
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                lock(&self.session)
                    .inflight
                    .on_ack(comp.pkid, pubcomp_result(&comp.reason));
            }
            Event::Incoming(Packet::Disconnect(disconnect)) => {
                return EventAction::ConnectionLost(format!(
                    "broker disconnected: {:?}",
                    disconnect.reason_code
                ));
            }
            Event::Incoming(other) => {
                debug!(target: "mqtt_transport", "MQTT event: {:?}", other);
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                lock(&self.session).inflight.on_outgoing_publish(pkid);
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("DISCONNECT sent to broker");
                return EventAction::Stop;
            }
            Event::Outgoing(_) => {}
        }
        EventAction::Continue
    }

    /// Fail in-flight publishes and build a fresh connection.
    /// Returns None when the supervisor should stop.
    async fn reconnect(&mut self, reason: &str, reconnect_attempts: &mut u32) -> Option<EventLoop> {
        error!("MQTT connection lost: {}", reason);
        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected(reason.to_string()));
        let lost_reason = format!("connection lost: {reason}");
        lock(&self.session).inflight.fail_all(&lost_reason);

        loop {
            let (attempt, delay_ms) = match self.reconnect_config.next_attempt(*reconnect_attempts)
            {
                ReconnectionDecision::Proceed { attempt, delay_ms } => (attempt, delay_ms),
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!(
                        "Max reconnection attempts ({}) exceeded",
                        *reconnect_attempts
                    );
                    error!("MQTT connection permanently failed: {}", reason);
                    let _ = self
                        .state_tx
                        .send(ConnectionState::PermanentlyDisconnected(reason));
                    return None;
                }
            };
            *reconnect_attempts = attempt;

            let max_display = self
                .reconnect_config
                .max_attempts
                .map_or("∞".to_string(), |max| max.to_string());
            info!(
                "Attempting reconnection {}/{} after {}ms delay",
                attempt, max_display, delay_ms
            );
            let _ = self.state_tx.send(ConnectionState::Reconnecting(attempt));

            if !self.interruptible_sleep(delay_ms).await {
                return None;
            }

            match MqttClient::create_connection(&self.config) {
                Ok((client, event_loop)) => {
                    // Anything enqueued on the old client since the loss is failed
                    // in the same critical section that installs the new client
                    let mut session = lock(&self.session);
                    session.inflight.fail_all(&lost_reason);
                    session.client = client;
                    return Some(event_loop);
                }
                Err(e) => error!("Failed to create new connection: {}", e),
            }
        }
    }

    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(&mut self, delay_ms: u64) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                if changed.is_err() || *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

fn puback_result(reason: &PubAckReason) -> Result<(), String> {
    match reason {
        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Ok(()),
        other => Err(format!("broker rejected publish: {other:?}")),
    }
}

fn pubrec_result(reason: &PubRecReason) -> Result<(), String> {
    match reason {
        PubRecReason::Success | PubRecReason::NoMatchingSubscribers => Ok(()),
        other => Err(format!("broker rejected publish: {other:?}")),
    }
}

fn pubcomp_result(reason: &PubCompReason) -> Result<(), String> {
    match reason {
        PubCompReason::Success => Ok(()),
        other => Err(format!("publish release failed: {other:?}")),
    }
}
