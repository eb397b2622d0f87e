//! Testing utilities and mock implementations
//!
//! Lets the publish bridge be exercised without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
