//! Configuration types, loading and validation
//!
//! Configuration is a YAML file with four sections: `connection`, `outputs`,
//! `filters` and `logging`. Every field has a default, so a minimal config
//! only names what it changes. A handful of `MESHRELAY_*` environment
//! variables override the file for containerized deployments.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Default serial baud rate
pub const DEFAULT_BAUD: u32 = 115_200;
/// Default TCP port exposed by Meshtastic devices
pub const DEFAULT_TCP_PORT: u16 = 4403;
/// Default HTTP sink timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub outputs: Vec<OutputConfig>,
    pub filters: FilterConfig,
    pub logging: LoggingConfig,
}

/// How to reach the Meshtastic node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// One of `serial`, `tcp`, `mqtt`
    #[serde(rename = "type")]
    pub kind: String,
    pub serial: SerialConfig,
    pub tcp: TcpConfig,
    pub mqtt: MqttConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: "serial".to_string(),
            serial: SerialConfig::default(),
            tcp: TcpConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

/// Serial port settings, 8-N-1 framing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: DEFAULT_BAUD,
        }
    }
}

/// TCP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub topic: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://localhost:1883".to_string(),
            topic: "meshtastic/#".to_string(),
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
        }
    }
}

/// One output destination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    Stdout {
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        format: OutputFormat,
    },
    File {
        #[serde(default = "default_true")]
        enabled: bool,
        path: String,
        #[serde(default)]
        format: OutputFormat,
        #[serde(default = "default_true")]
        rotate: bool,
        #[serde(default = "default_max_size_mb")]
        max_size_mb: u64,
        #[serde(default = "default_max_backups")]
        max_backups: u32,
    },
    Apprise {
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        url: String,
        #[serde(default = "default_apprise_tag")]
        tag: String,
        #[serde(default = "default_http_timeout")]
        timeout: u64,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        channels: HashMap<u32, AppriseChannelConfig>,
    },
    Webhook {
        #[serde(default = "default_true")]
        enabled: bool,
        #[serde(default)]
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_http_timeout")]
        timeout: u64,
    },
}

impl OutputConfig {
    pub fn enabled(&self) -> bool {
        match self {
            OutputConfig::Stdout { enabled, .. }
            | OutputConfig::File { enabled, .. }
            | OutputConfig::Apprise { enabled, .. }
            | OutputConfig::Webhook { enabled, .. } => *enabled,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutputConfig::Stdout { .. } => "stdout",
            OutputConfig::File { .. } => "file",
            OutputConfig::Apprise { .. } => "apprise",
            OutputConfig::Webhook { .. } => "webhook",
        }
    }
}

/// Per-channel Apprise override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppriseChannelConfig {
    /// Replacement tag for this channel, if non-empty
    pub tag: String,
    /// Explicit enable/disable; `None` inherits the sink default
    pub enabled: Option<bool>,
}

/// Rendering format shared by stdout and file sinks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

/// Declarative packet filter; empty lists match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub message_types: Vec<String>,
    pub node_ids: Vec<u32>,
    pub channels: Vec<u32>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `debug`, `info`, `warn`, `error`
    pub level: String,
    /// One of `json`, `text`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_backups() -> u32 {
    5
}

fn default_apprise_tag() -> String {
    "meshtastic".to_string()
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_http_method() -> String {
    "POST".to_string()
}

impl Config {
    /// Defaults plus one enabled stdout output
    pub fn with_default_output() -> Self {
        Self {
            outputs: vec![OutputConfig::Stdout {
                enabled: true,
                format: OutputFormat::Json,
            }],
            ..Self::default()
        }
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::InvalidConfig(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse from a YAML string
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| RelayError::InvalidConfig(format!("invalid config: {e}")))
    }

    /// Apply `MESHRELAY_*` environment overrides on top of the loaded file
    pub fn apply_env(&mut self) {
        let mut set = |key: &str, target: &mut String| {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    *target = value;
                }
            }
        };

        set("MESHRELAY_CONNECTION_TYPE", &mut self.connection.kind);
        set("MESHRELAY_SERIAL_PORT", &mut self.connection.serial.port);
        set("MESHRELAY_TCP_HOST", &mut self.connection.tcp.host);
        set("MESHRELAY_MQTT_BROKER", &mut self.connection.mqtt.broker);
        set("MESHRELAY_MQTT_TOPIC", &mut self.connection.mqtt.topic);
        set("MESHRELAY_MQTT_USERNAME", &mut self.connection.mqtt.username);
        set("MESHRELAY_MQTT_PASSWORD", &mut self.connection.mqtt.password);
        set("MESHRELAY_MQTT_CLIENT_ID", &mut self.connection.mqtt.client_id);
        set("MESHRELAY_LOG_LEVEL", &mut self.logging.level);
        set("MESHRELAY_LOG_FORMAT", &mut self.logging.format);

        if let Ok(value) = std::env::var("MESHRELAY_SERIAL_BAUD") {
            if let Ok(baud) = value.parse() {
                self.connection.serial.baud = baud;
            }
        }
        if let Ok(value) = std::env::var("MESHRELAY_TCP_PORT") {
            if let Ok(port) = value.parse() {
                self.connection.tcp.port = port;
            }
        }
    }

    /// Check the configuration for errors, mirroring what the connection and
    /// sink constructors would reject, so a dry run catches problems without
    /// touching any transport.
    pub fn validate(&self) -> Result<()> {
        match self.connection.kind.as_str() {
            "serial" => {
                if self.connection.serial.port.is_empty() {
                    return Err(RelayError::InvalidConfig(
                        "connection.serial.port is required for serial connection".to_string(),
                    ));
                }
            }
            "tcp" => {
                if self.connection.tcp.host.is_empty() {
                    return Err(RelayError::InvalidConfig(
                        "connection.tcp.host is required for tcp connection".to_string(),
                    ));
                }
            }
            "mqtt" => {
                if self.connection.mqtt.broker.is_empty() {
                    return Err(RelayError::InvalidConfig(
                        "connection.mqtt.broker is required for mqtt connection".to_string(),
                    ));
                }
            }
            "" => {
                return Err(RelayError::InvalidConfig(
                    "connection.type is required".to_string(),
                ))
            }
            other => {
                return Err(RelayError::InvalidConfig(format!(
                    "invalid connection.type: {other} (must be serial, tcp, or mqtt)"
                )))
            }
        }

        if self.outputs.is_empty() {
            return Err(RelayError::InvalidConfig(
                "at least one output must be configured".to_string(),
            ));
        }

        for (i, output) in self.outputs.iter().enumerate() {
            match output {
                OutputConfig::Apprise { url, .. } if url.is_empty() => {
                    return Err(RelayError::InvalidConfig(format!(
                        "outputs[{i}]: apprise url is required"
                    )))
                }
                OutputConfig::Webhook { url, .. } if url.is_empty() => {
                    return Err(RelayError::InvalidConfig(format!(
                        "outputs[{i}]: webhook url is required"
                    )))
                }
                OutputConfig::File { path, .. } if path.is_empty() => {
                    return Err(RelayError::InvalidConfig(format!(
                        "outputs[{i}]: file path is required"
                    )))
                }
                _ => {}
            }
        }

        if !self.outputs.iter().any(|o| o.enabled()) {
            return Err(RelayError::InvalidConfig(
                "at least one output must be enabled".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(RelayError::InvalidConfig(format!(
                    "invalid logging.level: {other} (must be debug, info, warn, or error)"
                )))
            }
        }
        match self.logging.format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(RelayError::InvalidConfig(format!(
                    "invalid logging.format: {other} (must be json or text)"
                )))
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::with_default_output();
        assert_eq!(cfg.connection.kind, "serial");
        assert_eq!(cfg.connection.serial.port, "/dev/ttyUSB0");
        assert_eq!(cfg.connection.serial.baud, 115_200);
        assert_eq!(cfg.connection.tcp.port, 4403);
        assert_eq!(cfg.connection.mqtt.topic, "meshtastic/#");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_yaml_parse() {
        let cfg = Config::from_yaml(
            r#"
connection:
  type: tcp
  tcp:
    host: 192.168.1.20
    port: 4403
outputs:
  - type: stdout
    format: text
  - type: file
    path: /tmp/mesh.log
    max_size_mb: 10
    max_backups: 3
filters:
  message_types: ["TEXT_MESSAGE_APP"]
  channels: [0, 1]
logging:
  level: debug
  format: json
"#,
        )
        .unwrap();

        assert_eq!(cfg.connection.kind, "tcp");
        assert_eq!(cfg.connection.tcp.host, "192.168.1.20");
        assert_eq!(cfg.outputs.len(), 2);
        assert!(cfg.outputs[0].enabled());
        assert_eq!(cfg.outputs[1].kind(), "file");
        assert_eq!(cfg.filters.message_types, vec!["TEXT_MESSAGE_APP"]);
        assert_eq!(cfg.filters.channels, vec![0, 1]);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_apprise_channel_overrides_parse() {
        let cfg = Config::from_yaml(
            r#"
outputs:
  - type: apprise
    url: http://localhost:8000/notify
    channels:
      3:
        enabled: false
      2:
        tag: alerts
"#,
        )
        .unwrap();

        match &cfg.outputs[0] {
            OutputConfig::Apprise { channels, tag, .. } => {
                assert_eq!(tag, "meshtastic");
                assert_eq!(channels[&3].enabled, Some(false));
                assert_eq!(channels[&2].tag, "alerts");
                assert_eq!(channels[&2].enabled, None);
            }
            other => panic!("expected apprise output, got {other:?}"),
        }
    }

    #[test]
    fn test_mqtt_broker_required() {
        let mut cfg = Config::with_default_output();
        cfg.connection.kind = "mqtt".to_string();
        cfg.connection.mqtt.broker = String::new();

        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "connection.mqtt.broker is required for mqtt connection"
        );
    }

    #[test]
    fn test_invalid_connection_type() {
        let mut cfg = Config::with_default_output();
        cfg.connection.kind = "bluetooth".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid connection.type: bluetooth"));
    }

    #[test]
    fn test_no_outputs_rejected() {
        let cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.to_string(), "at least one output must be configured");
    }

    #[test]
    fn test_no_enabled_outputs_rejected() {
        let mut cfg = Config::with_default_output();
        cfg.outputs = vec![OutputConfig::Stdout {
            enabled: false,
            format: OutputFormat::Json,
        }];
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.to_string(), "at least one output must be enabled");
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::with_default_output();
        std::env::set_var("MESHRELAY_CONNECTION_TYPE", "tcp");
        std::env::set_var("MESHRELAY_TCP_HOST", "radio.local");
        std::env::set_var("MESHRELAY_TCP_PORT", "4404");
        cfg.apply_env();
        std::env::remove_var("MESHRELAY_CONNECTION_TYPE");
        std::env::remove_var("MESHRELAY_TCP_HOST");
        std::env::remove_var("MESHRELAY_TCP_PORT");

        assert_eq!(cfg.connection.kind, "tcp");
        assert_eq!(cfg.connection.tcp.host, "radio.local");
        assert_eq!(cfg.connection.tcp.port, 4404);
    }
}
