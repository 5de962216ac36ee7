//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Notifier credentials may also come from TWILIO_ACCOUNT_SID / TWILIO_AUTH_TOKEN.

use crate::domain::types::{Position, Zone, ZoneKind};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub topic: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "follower-gateway".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_device_port() -> u16 {
    5683
}

fn default_command_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PointConfig {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZonesConfig {
    pub destination: PointConfig,
    pub origin: PointConfig,
    pub tolerance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Detector tick interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { poll_interval_ms: default_poll_interval_ms() }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// When false, notifications are only logged
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub destination_template: String,
    #[serde(default)]
    pub origin_template: String,
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on concurrently running notification sends
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: default_api_base(),
            account_sid: None,
            auth_token: None,
            from: String::new(),
            to: String::new(),
            destination_template: String::new(),
            origin_template: String::new(),
            timeout_ms: default_notify_timeout_ms(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.twilio.com".to_string()
}

fn default_notify_timeout_ms() -> u64 {
    10_000
}

fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Status/metrics HTTP port (0 to disable)
    #[serde(default = "default_status_port")]
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { port: default_status_port() }
    }
}

fn default_status_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub zones: ZonesConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic: String,
    mqtt_client_id: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    device_host: String,
    device_port: u16,
    command_timeout_ms: u64,
    destination: Position,
    origin: Position,
    tolerance: f64,
    poll_interval_ms: u64,
    notify_enabled: bool,
    notify_api_base: String,
    notify_account_sid: Option<String>,
    notify_auth_token: Option<String>,
    notify_from: String,
    notify_to: String,
    destination_template: String,
    origin_template: String,
    notify_timeout_ms: u64,
    notify_max_in_flight: usize,
    status_port: u16,
    metrics_interval_secs: u64,
}

pub const ENV_ACCOUNT_SID: &str = "TWILIO_ACCOUNT_SID";
pub const ENV_AUTH_TOKEN: &str = "TWILIO_AUTH_TOKEN";

/// File value first, then the environment
fn credential(from_file: Option<String>, var: &str) -> Option<String> {
    from_file.or_else(|| env::var(var).ok().filter(|v| !v.is_empty()))
}

/// Built-in defaults; Twilio credentials still come from the environment
impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: "default".to_string(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: "dwm/node/4685/uplink/location".to_string(),
            mqtt_client_id: default_client_id(),
            mqtt_username: None,
            mqtt_password: None,
            device_host: "192.168.190.40".to_string(),
            device_port: 5683,
            command_timeout_ms: 5000,
            destination: Position { x: 1.6, y: 3.0 },
            origin: Position { x: 0.0, y: 0.0 },
            tolerance: 0.3,
            poll_interval_ms: 500,
            notify_enabled: false,
            notify_api_base: default_api_base(),
            notify_account_sid: credential(None, ENV_ACCOUNT_SID),
            notify_auth_token: credential(None, ENV_AUTH_TOKEN),
            notify_from: String::new(),
            notify_to: String::new(),
            destination_template: String::new(),
            origin_template: String::new(),
            notify_timeout_ms: default_notify_timeout_ms(),
            notify_max_in_flight: default_max_in_flight(),
            status_port: 9090,
            metrics_interval_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let mut config = Self::from_toml(toml_config)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    fn from_toml(toml_config: TomlConfig) -> anyhow::Result<Self> {
        let zones = toml_config.zones;
        let destination = Position::new(zones.destination.x, zones.destination.y)
            .context("destination zone center must be finite")?;
        let origin = Position::new(zones.origin.x, zones.origin.y)
            .context("origin zone center must be finite")?;
        if !(zones.tolerance.is_finite() && zones.tolerance > 0.0) {
            anyhow::bail!("zone tolerance must be a positive number, got {}", zones.tolerance);
        }
        if toml_config.device.command_timeout_ms == 0 {
            anyhow::bail!("device.command_timeout_ms must be greater than zero");
        }

        let notify = toml_config.notify;
        Ok(Self {
            config_file: "inline".to_string(),
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_topic: toml_config.mqtt.topic,
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            device_host: toml_config.device.host,
            device_port: toml_config.device.port,
            command_timeout_ms: toml_config.device.command_timeout_ms,
            destination,
            origin,
            tolerance: zones.tolerance,
            poll_interval_ms: toml_config.monitor.poll_interval_ms.max(1),
            notify_enabled: notify.enabled,
            notify_api_base: notify.api_base,
            notify_account_sid: credential(notify.account_sid, ENV_ACCOUNT_SID),
            notify_auth_token: credential(notify.auth_token, ENV_AUTH_TOKEN),
            notify_from: notify.from,
            notify_to: notify.to,
            destination_template: notify.destination_template,
            origin_template: notify.origin_template,
            notify_timeout_ms: notify.timeout_ms,
            notify_max_in_flight: notify.max_in_flight.max(1),
            status_port: toml_config.status.port,
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
        })
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).context("Failed to parse config")?;
        Self::from_toml(toml_config)
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn destination_zone(&self) -> Zone {
        Zone::new(ZoneKind::Destination, self.destination, self.tolerance)
    }

    pub fn origin_zone(&self) -> Zone {
        Zone::new(ZoneKind::Origin, self.origin, self.tolerance)
    }

    /// `host:port` of the device controller
    pub fn device_addr(&self) -> String {
        format!("{}:{}", self.device_host, self.device_port)
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn device_host(&self) -> &str {
        &self.device_host
    }

    pub fn device_port(&self) -> u16 {
        self.device_port
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled
    }

    pub fn notify_api_base(&self) -> &str {
        &self.notify_api_base
    }

    pub fn notify_account_sid(&self) -> Option<&str> {
        self.notify_account_sid.as_deref()
    }

    pub fn notify_auth_token(&self) -> Option<&str> {
        self.notify_auth_token.as_deref()
    }

    pub fn notify_from(&self) -> &str {
        &self.notify_from
    }

    pub fn notify_to(&self) -> &str {
        &self.notify_to
    }

    pub fn destination_template(&self) -> &str {
        &self.destination_template
    }

    pub fn origin_template(&self) -> &str {
        &self.origin_template
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn notify_max_in_flight(&self) -> usize {
        self.notify_max_in_flight
    }

    pub fn status_port(&self) -> u16 {
        self.status_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    /// Builder method for tests to set the command timeout
    #[cfg(test)]
    pub fn with_command_timeout_ms(mut self, ms: u64) -> Self {
        self.command_timeout_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[mqtt]
host = "broker.local"
topic = "dwm/node/1/uplink/location"

[device]
host = "10.0.0.40"

[zones]
destination = { x = 2.0, y = 4.5 }
origin = { x = -1.0, y = 0.5 }
tolerance = 0.25
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_topic(), "dwm/node/4685/uplink/location");
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.destination_zone().center, Position { x: 1.6, y: 3.0 });
        assert_eq!(config.origin_zone().center, Position { x: 0.0, y: 0.0 });
        assert_eq!(config.tolerance(), 0.3);
        assert!(!config.notify_enabled());
    }

    #[test]
    fn test_minimal_toml_fills_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.mqtt_host(), "broker.local");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.device_addr(), "10.0.0.40:5683");
        assert_eq!(config.command_timeout(), Duration::from_millis(5000));
        assert_eq!(config.destination_zone().center, Position { x: 2.0, y: 4.5 });
        assert_eq!(config.origin_zone().tolerance, 0.25);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.status_port(), 9090);
        assert_eq!(config.notify_max_in_flight(), 4);
    }

    #[test]
    fn test_rejects_non_positive_tolerance() {
        let bad = MINIMAL.replace("tolerance = 0.25", "tolerance = 0.0");
        assert!(Config::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_rejects_zero_command_timeout() {
        let bad = MINIMAL.replace("[device]\n", "[device]\ncommand_timeout_ms = 0\n");
        assert_ne!(bad, MINIMAL);
        let err = Config::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("command_timeout_ms"));
    }

    #[test]
    fn test_rejects_missing_zones() {
        let bad = r#"
[mqtt]
host = "h"
topic = "t"

[device]
host = "d"
"#;
        assert!(Config::from_toml_str(bad).is_err());
    }

    #[test]
    fn test_with_command_timeout() {
        let config = Config::default().with_command_timeout_ms(250);
        assert_eq!(config.command_timeout(), Duration::from_millis(250));
    }
}
