//! Session timing and behaviour configuration
//!
//! All durations are stored in milliseconds so the configuration can be
//! written by hand as JSON. Missing fields take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::transport::{ConnectOptions, TransportHint};

/// Floor applied to the RSSI polling period.
pub const MIN_RSSI_POLL_PERIOD_MS: u64 = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    /// Time allowed between issuing `connect` and the first link callback.
    pub connecting_timeout_ms: u64,
    /// Time allowed between `Connected` and the start of service discovery.
    pub connected_timeout_ms: u64,
    pub service_discovery_timeout_ms: u64,
    /// Delay before service discovery is requested after `Connected`.
    pub service_discovery_start_delay_ms: u64,
    /// Grace period before the disconnect hook runs.
    pub disconnect_event_delay_ms: u64,

    /// Extra issuance attempts after the stack rejects a request.
    pub busy_retry_count: u32,
    pub busy_retry_delay_ms: u64,

    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub subscription_timeout_ms: u64,
    pub rssi_timeout_ms: u64,
    pub mtu_timeout_ms: u64,

    /// RSSI polling period once services are discovered; `None` disables polling.
    pub rssi_poll_period_ms: Option<u64>,
    /// MTU requested once services are discovered; `None` keeps the default.
    pub desired_mtu: Option<u16>,
    /// Subscribe to every declared notifying characteristic after discovery.
    pub auto_subscribe: bool,
    /// Return failed outcomes as errors instead of result values.
    pub raise_errors: bool,

    /// Capacity of the notification broadcast; slow subscribers lose the
    /// oldest values first.
    pub notification_capacity: usize,

    pub auto_reconnect: bool,
    pub transport_hint: TransportHint,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            connecting_timeout_ms: 45_000,
            connected_timeout_ms: 4_000,
            service_discovery_timeout_ms: 45_000,
            service_discovery_start_delay_ms: 400,
            disconnect_event_delay_ms: 600,
            busy_retry_count: 3,
            busy_retry_delay_ms: 50,
            read_timeout_ms: 1_000,
            write_timeout_ms: 1_000,
            subscription_timeout_ms: 1_000,
            rssi_timeout_ms: 1_000,
            mtu_timeout_ms: 1_000,
            rssi_poll_period_ms: None,
            desired_mtu: None,
            auto_subscribe: true,
            raise_errors: false,
            notification_capacity: 64,
            auto_reconnect: false,
            transport_hint: TransportHint::Le,
        }
    }
}

impl GattConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: GattConfig = serde_json::from_str(json)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.notification_capacity == 0 {
            return Err(ConfigError::Invalid(
                "notification_capacity must be at least 1".to_string(),
            ));
        }
        let timeouts = [
            ("connecting_timeout_ms", self.connecting_timeout_ms),
            ("connected_timeout_ms", self.connected_timeout_ms),
            ("service_discovery_timeout_ms", self.service_discovery_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("subscription_timeout_ms", self.subscription_timeout_ms),
            ("rssi_timeout_ms", self.rssi_timeout_ms),
            ("mtu_timeout_ms", self.mtu_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
        }
        Ok(())
    }

    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_millis(self.connecting_timeout_ms)
    }

    pub fn connected_timeout(&self) -> Duration {
        Duration::from_millis(self.connected_timeout_ms)
    }

    pub fn service_discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.service_discovery_timeout_ms)
    }

    pub fn service_discovery_start_delay(&self) -> Duration {
        Duration::from_millis(self.service_discovery_start_delay_ms)
    }

    pub fn disconnect_event_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_event_delay_ms)
    }

    pub fn busy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.busy_retry_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms)
    }

    pub fn rssi_timeout(&self) -> Duration {
        Duration::from_millis(self.rssi_timeout_ms)
    }

    pub fn mtu_timeout(&self) -> Duration {
        Duration::from_millis(self.mtu_timeout_ms)
    }

    /// The polling period, raised to [`MIN_RSSI_POLL_PERIOD_MS`] if set lower.
    pub fn rssi_poll_period(&self) -> Option<Duration> {
        self.rssi_poll_period_ms
            .map(|ms| Duration::from_millis(ms.max(MIN_RSSI_POLL_PERIOD_MS)))
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            auto_reconnect: self.auto_reconnect,
            transport: self.transport_hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GattConfig::default();
        assert_eq!(config.connecting_timeout(), Duration::from_secs(45));
        assert_eq!(config.connected_timeout(), Duration::from_secs(4));
        assert_eq!(config.disconnect_event_delay(), Duration::from_millis(600));
        assert_eq!(config.busy_retry_count, 3);
        assert!(config.auto_subscribe);
        assert!(config.rssi_poll_period().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = GattConfig::from_json_str(
            r#"{ "busy_retry_count": 5, "desired_mtu": 185, "transport_hint": "Auto" }"#,
        )
        .unwrap();
        assert_eq!(config.busy_retry_count, 5);
        assert_eq!(config.desired_mtu, Some(185));
        assert_eq!(config.transport_hint, TransportHint::Auto);
        assert_eq!(config.read_timeout_ms, 1_000);
    }

    #[test]
    fn test_rssi_poll_period_is_clamped() {
        let config = GattConfig {
            rssi_poll_period_ms: Some(100),
            ..GattConfig::default()
        };
        assert_eq!(
            config.rssi_poll_period(),
            Some(Duration::from_millis(MIN_RSSI_POLL_PERIOD_MS))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = GattConfig::from_json_str(r#"{ "read_timeout_ms": 0 }"#).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid("read_timeout_ms must be non-zero".to_string())
        );
        assert!(matches!(
            GattConfig::from_json_str("{ not json"),
            Err(ConfigError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatt.json");
        std::fs::write(&path, r#"{ "auto_subscribe": false }"#).unwrap();

        let config = GattConfig::from_file(&path).unwrap();
        assert!(!config.auto_subscribe);

        let missing = GattConfig::from_file(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::IoError(_))));
    }
}
