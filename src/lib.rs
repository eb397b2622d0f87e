//! MQTT publishing for single-threaded script environments
//!
//! A script instance (a [`Vu`]) owns one thread and must never block it on
//! the network. This crate lets it publish MQTT messages either synchronously
//! or asynchronously with completion handlers, and guarantees that every
//! asynchronous publish produces exactly one outcome, delivered back on the
//! owning thread.
//!
//! # Overview
//!
//! - [`publish`] - the publish bridge, request validation, events and metrics
//! - [`transport`] - the [`PublishClient`] abstraction and its rumqttc client
//! - [`vu`] - the owning environment and its callback event loop
//! - [`observability`] - structured logging and the metric registry
//! - [`config`] - TOML configuration
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_publisher::observability::metrics::Registry;
//! use mqtt_publisher::publish::{MqttMetrics, PublishHandlers, PublishRequest, Publisher};
//! use mqtt_publisher::testing::MockClient;
//! use mqtt_publisher::config::MetricsSection;
//! use mqtt_publisher::vu::Vu;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let mut vu = Vu::new(Arc::new(Registry::new()));
//! let metrics = MqttMetrics::register(&vu, &MetricsSection::default())?;
//! let (samples, _rx) = tokio::sync::mpsc::unbounded_channel();
//! vu.activate(samples);
//!
//! let publisher = Publisher::new(
//!     Arc::new(MockClient::connected()),
//!     metrics,
//!     runtime.handle().clone(),
//! )?;
//!
//! let request = PublishRequest::new("sensors/temp", 1, "23.5", false, 1000)?;
//! let handlers = PublishHandlers::new().on_success(|event| {
//!     println!("published to {}", event.topic());
//!     Ok(())
//! });
//! publisher.publish(&vu, request, handlers)?;
//! vu.run_event_loop()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod publish;
pub mod testing;
pub mod transport;
pub mod vu;

pub use config::*;
pub use error::{HandlerError, PublishError, PublishResult};
pub use publish::{
    ErrorEvent, MqttMetrics, PublishEvent, PublishHandlers, PublishOutcome, PublishRequest,
    Publisher,
};
pub use transport::mqtt::MqttClient;
pub use transport::{CompletionToken, PublishClient};
pub use vu::Vu;
