//! Configuration types for the scooter session controller
//!
//! This module provides the discovery and session settings plus the GATT
//! identifiers shared by every transport implementation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SessionError};

/// How long a discovered scooter stays listed without a fresh advertisement
pub const DEFAULT_ADVERTISEMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the session command queue
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 64;

/// Default capacity of the parsed-frame broadcast channel
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 256;

/// Nordic UART service carrying the serial channel
pub const SERIAL_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Serial write characteristic (host to scooter)
pub const SERIAL_TX_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Serial notify characteristic (scooter to host), the only channel that is decrypted
pub const SERIAL_RX_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Xiaomi authentication service
pub const AUTH_SERVICE_UUID: &str = "0000fe95-0000-1000-8000-00805f9b34fb";

/// Xiaomi authentication control characteristic
pub const UPNP_CHAR_UUID: &str = "00000010-0000-1000-8000-00805f9b34fb";

/// Xiaomi authentication data characteristic
pub const AVDTP_CHAR_UUID: &str = "00000019-0000-1000-8000-00805f9b34fb";

/// Main configuration for the session controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Discovery behaviour
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Session behaviour
    #[serde(default)]
    pub session: SessionSettings,
}

impl SessionConfig {
    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the controller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.discovery.advertisement_timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "advertisement_timeout must be greater than zero".to_string(),
            ));
        }
        if self.session.command_queue_size == 0 || self.session.event_queue_size == 0 {
            return Err(SessionError::InvalidConfig(
                "queue sizes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Discovery registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Inactivity period after which a scooter is dropped from the list
    #[serde(with = "humantime_serde", default = "default_advertisement_timeout")]
    pub advertisement_timeout: Duration,

    /// Advertised name prefixes that identify scooters (empty = accept all)
    #[serde(default = "default_name_prefixes")]
    pub name_prefixes: Vec<String>,
}

fn default_advertisement_timeout() -> Duration {
    DEFAULT_ADVERTISEMENT_TIMEOUT
}

fn default_name_prefixes() -> Vec<String> {
    vec!["MIScooter".to_string(), "NBScooter".to_string()]
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            advertisement_timeout: DEFAULT_ADVERTISEMENT_TIMEOUT,
            name_prefixes: default_name_prefixes(),
        }
    }
}

impl DiscoveryConfig {
    /// Whether an advertised name belongs to a scooter
    pub fn accepts_name(&self, name: &str) -> bool {
        self.name_prefixes.is_empty()
            || self
                .name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

/// Session controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Capacity of the command queue behind `SessionHandle`
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,

    /// Capacity of the parsed-frame broadcast channel
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,

    /// Reconnect automatically when a scooter waiting for its pairing button
    /// changes its advertisement
    #[serde(default = "default_reconnect_on_button_press")]
    pub reconnect_on_button_press: bool,
}

fn default_command_queue_size() -> usize {
    DEFAULT_COMMAND_QUEUE_SIZE
}

fn default_event_queue_size() -> usize {
    DEFAULT_EVENT_QUEUE_SIZE
}

fn default_reconnect_on_button_press() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            reconnect_on_button_press: true,
        }
    }
}

/// Builder for SessionConfig
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertisement expiry timeout
    pub fn advertisement_timeout(mut self, timeout: Duration) -> Self {
        self.config.discovery.advertisement_timeout = timeout;
        self
    }

    /// Replace the accepted name prefixes
    pub fn name_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.discovery.name_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Accept every advertised name
    pub fn accept_all_names(mut self) -> Self {
        self.config.discovery.name_prefixes.clear();
        self
    }

    /// Set command queue capacity
    pub fn command_queue_size(mut self, size: usize) -> Self {
        self.config.session.command_queue_size = size.max(1);
        self
    }

    /// Set parsed-frame channel capacity
    pub fn event_queue_size(mut self, size: usize) -> Self {
        self.config.session.event_queue_size = size.max(1);
        self
    }

    /// Enable or disable the button-press reconnect
    pub fn reconnect_on_button_press(mut self, enabled: bool) -> Self {
        self.config.session.reconnect_on_button_press = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
