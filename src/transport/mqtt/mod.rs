//! rumqttc-backed MQTT client for the publish bridge
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - Pure connection state, reconnection pacing and option building
//! - [`inflight`] - Pure bookkeeping from packet ids back to completion tokens
//! - [`client`] - Impure I/O: event loop supervision and the [`PublishClient`] impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_publisher::config::MqttSection;
//! use mqtt_publisher::transport::mqtt::MqttClient;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     client_id: None,
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 60,
//!     connect_timeout_ms: 5000,
//!     max_reconnect_attempts: None,
//! };
//!
//! let mut client = MqttClient::new(config)?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`PublishClient`]: crate::transport::PublishClient

pub mod client;
pub mod connection;
pub mod inflight;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig, ReconnectionDecision};
