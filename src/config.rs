//! Configuration system for the MQTT publisher
//!
//! Loads a TOML file with three sections: `[mqtt]` for the broker connection,
//! `[publish]` for request defaults and `[metrics]` for metric names.

use crate::observability::metrics::is_valid_metric_name;
use crate::publish::request::MAX_TIMEOUT_MILLIS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Main publisher configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Client identifier; generated when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long `connect` waits for ConnAck in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Maximum reconnection attempts after a connection loss (None = unlimited)
    pub max_reconnect_attempts: Option<u32>,
}

impl MqttSection {
    /// Username and password read from the configured environment variables.
    ///
    /// `None` unless the username variable is configured and set; a missing
    /// password becomes an empty one.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = get_env_var_optional(self.username_env.as_ref())?;
        let password = get_env_var_optional(self.password_env.as_ref()).unwrap_or_default();
        Some((username, password))
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5000
}

/// Defaults applied to publishes issued by the CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSection {
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            qos: 0,
            retain: false,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Metric names registered for the publisher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsSection {
    pub sent_bytes: String,
    pub received_bytes: String,
    pub sent_messages: String,
    pub received_messages: String,
    pub sent_dates: String,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            sent_bytes: "mqtt_sent_bytes".to_string(),
            received_bytes: "mqtt_received_bytes".to_string(),
            sent_messages: "mqtt_sent_messages_count".to_string(),
            received_messages: "mqtt_received_messages_count".to_string(),
            sent_dates: "mqtt_sent_dates".to_string(),
        }
    }
}

impl MetricsSection {
    fn labels(&self) -> [&str; 5] {
        [
            &self.sent_bytes,
            &self.received_bytes,
            &self.sent_messages,
            &self.received_messages,
            &self.sent_dates,
        ]
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PublisherConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PublisherConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.mqtt.broker_url)?;

        if self.publish.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "publish.qos must be 0, 1 or 2, got {}",
                self.publish.qos
            )));
        }

        if self.publish.timeout_ms > MAX_TIMEOUT_MILLIS {
            return Err(ConfigError::InvalidConfig(format!(
                "publish.timeout_ms {} exceeds maximum {MAX_TIMEOUT_MILLIS}",
                self.publish.timeout_ms
            )));
        }

        if let Some(0) = self.mqtt.max_reconnect_attempts {
            return Err(ConfigError::InvalidConfig(
                "mqtt.max_reconnect_attempts must be greater than 0 or omitted for unlimited"
                    .to_string(),
            ));
        }

        for label in self.metrics.labels() {
            if !is_valid_metric_name(label) {
                return Err(ConfigError::InvalidConfig(format!(
                    "metric name '{label}' is not valid"
                )));
            }
        }

        Ok(())
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(broker_url)
        .map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

    let has_host = url.host_str().is_some_and(|host| !host.is_empty());
    if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp") || !has_host {
        return Err(ConfigError::InvalidBrokerUrl(broker_url.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "loadgen-1"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30
connect_timeout_ms = 2000
max_reconnect_attempts = 5

[publish]
qos = 1
retain = true
timeout_ms = 250

[metrics]
sent_bytes = "broker_sent_bytes"
"#;

        let config = PublisherConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.mqtt.client_id.as_deref(), Some("loadgen-1"));
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.mqtt.max_reconnect_attempts, Some(5));
        assert_eq!(config.publish.qos, 1);
        assert!(config.publish.retain);
        assert_eq!(config.publish.timeout_ms, 250);
        assert_eq!(config.metrics.sent_bytes, "broker_sent_bytes");
        // Unset labels keep their defaults
        assert_eq!(config.metrics.sent_dates, "mqtt_sent_dates");
    }

    #[test]
    fn test_minimal_config() {
        let config = PublisherConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
        )
        .unwrap();

        assert_eq!(config.mqtt.client_id, None);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.mqtt.connect_timeout_ms, 5000);
        assert_eq!(config.publish, PublishSection::default());
        assert_eq!(config.metrics, MetricsSection::default());
    }

    #[test]
    fn test_invalid_broker_url() {
        for url in ["invalid-url", "http://localhost:1883", "mqtt://"] {
            let content = format!("[mqtt]\nbroker_url = \"{url}\"\n");
            let result = PublisherConfig::from_toml_str(&content);
            assert!(
                matches!(result, Err(ConfigError::InvalidBrokerUrl(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_invalid_qos() {
        let result = PublisherConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[publish]
qos = 3
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_timeout_too_long() {
        let content = format!(
            "[mqtt]\nbroker_url = \"mqtt://localhost\"\n\n[publish]\ntimeout_ms = {}\n",
            MAX_TIMEOUT_MILLIS + 1
        );
        let result = PublisherConfig::from_toml_str(&content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_reconnect_attempts_rejected() {
        let result = PublisherConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
max_reconnect_attempts = 0
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_metric_name_rejected() {
        let result = PublisherConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[metrics]
sent_bytes = ""
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_credentials_from_environment() {
        let config = PublisherConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
username_env = "MQTT_PUBLISHER_TEST_USER"
password_env = "MQTT_PUBLISHER_TEST_PASS_UNSET"
"#,
        )
        .unwrap();

        std::env::set_var("MQTT_PUBLISHER_TEST_USER", "loadgen");
        assert_eq!(
            config.mqtt.credentials(),
            Some(("loadgen".to_string(), String::new()))
        );
    }

    #[test]
    fn test_no_credentials_without_username() {
        let config = PublisherConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
username_env = "MQTT_PUBLISHER_TEST_USER_UNSET"
password_env = "MQTT_PUBLISHER_TEST_PASS_SET"
"#,
        )
        .unwrap();

        std::env::set_var("MQTT_PUBLISHER_TEST_PASS_SET", "secret");
        assert_eq!(config.mqtt.credentials(), None);

        let anonymous = PublisherConfig::from_toml_str(
            "[mqtt]\nbroker_url = \"mqtt://localhost:1883\"\n",
        )
        .unwrap();
        assert_eq!(anonymous.mqtt.credentials(), None);
    }
}
