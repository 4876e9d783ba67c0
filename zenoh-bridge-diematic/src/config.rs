//! Configuration for the Diematic bridge.

use clap::ValueEnum;
use diematic_common::{Format, LoggingConfig, ZenohConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use zenoh::key_expr::KeyExpr;

use crate::acquisition::{Block, MAX_BLOCK_COUNT, default_blocks};
use crate::schema::{RegisterEntry, Schema, SchemaError};
use crate::sink::build_key_expr;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] diematic_common::Error),
    #[error("Invalid register schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiematicBridgeConfig {
    /// Serial link and block layout
    #[serde(default)]
    pub modbus: ModbusConfig,

    /// Register schema, in order
    pub registers: Vec<RegisterEntry>,

    /// Measurement name and static tags of published snapshots
    #[serde(default)]
    pub publish: PublishConfig,

    /// Where snapshots are published
    #[serde(default)]
    pub backend: Backend,

    /// InfluxDB settings (required when `backend` is "influxdb")
    #[serde(default)]
    pub influxdb: Option<InfluxConfig>,

    /// Zenoh settings (used when `backend` is "zenoh")
    #[serde(default)]
    pub zenoh: ZenohSinkConfig,

    /// Seconds between cycles. Absent means a single cycle, then exit.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus RTU link configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0"). Can be given on the command line instead.
    #[serde(default)]
    pub device: Option<String>,

    /// Modbus unit/slave ID of the controller (default: 10)
    #[serde(default = "default_unit")]
    pub unit: u8,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Per-read timeout in seconds (default: 10)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Read attempts per block (default: 3)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Register blocks read each cycle, in order
    #[serde(default = "default_blocks")]
    pub blocks: Vec<Block>,
}

fn default_unit() -> u8 {
    10
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            device: None,
            unit: default_unit(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            blocks: default_blocks(),
        }
    }
}

impl ModbusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.unit == 0 || self.unit > 247 {
            return Err(ConfigError::Validation(format!(
                "modbus.unit must be 1-247, got {}",
                self.unit
            )));
        }

        if self.retries == 0 {
            return Err(ConfigError::Validation(
                "modbus.retries must be at least 1".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "modbus.timeout_secs must be at least 1".to_string(),
            ));
        }

        match self.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "invalid parity '{}' (use none, even, or odd)",
                    self.parity
                )));
            }
        }

        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::Validation(format!(
                "modbus.data_bits must be 5-8, got {}",
                self.data_bits
            )));
        }

        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ConfigError::Validation(format!(
                "modbus.stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }

        for (i, block) in self.blocks.iter().enumerate() {
            if block.count == 0 || block.count > MAX_BLOCK_COUNT {
                return Err(ConfigError::Validation(format!(
                    "block {} ({}): count must be 1-{}",
                    i, block.start, MAX_BLOCK_COUNT
                )));
            }
            if block.end() > usize::from(u16::MAX) + 1 {
                return Err(ConfigError::Validation(format!(
                    "block {} ({}): extends past address 65535",
                    i, block.start
                )));
            }
            if let Some(other) = self.blocks[..i].iter().find(|b| b.overlaps(block)) {
                return Err(ConfigError::Validation(format!(
                    "block {} overlaps block {}",
                    block, other
                )));
            }
        }

        Ok(())
    }
}

/// Publishing sink selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Only log the snapshot
    #[default]
    None,
    /// InfluxDB 1.x HTTP API
    Influxdb,
    /// Zenoh put
    Zenoh,
}

/// Measurement name and static tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Measurement name (default: "diematic")
    #[serde(default = "default_measurement")]
    pub measurement: String,

    /// Static tags. A value of "auto" is replaced by the local hostname.
    #[serde(default = "default_tags")]
    pub tags: BTreeMap<String, String>,
}

fn default_measurement() -> String {
    "diematic".to_string()
}

fn default_tags() -> BTreeMap<String, String> {
    BTreeMap::from([("host".to_string(), "auto".to_string())])
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            measurement: default_measurement(),
            tags: default_tags(),
        }
    }
}

impl PublishConfig {
    /// Tags with "auto" values resolved.
    pub fn resolved_tags(&self) -> BTreeMap<String, String> {
        self.tags
            .iter()
            .map(|(key, value)| {
                let value = if value == "auto" {
                    local_hostname()
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect()
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// InfluxDB 1.x connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Server host (default: "localhost")
    #[serde(default = "default_influx_host")]
    pub host: String,

    /// Server port (default: 8086)
    #[serde(default = "default_influx_port")]
    pub port: u16,

    /// Use HTTPS
    #[serde(default)]
    pub ssl: bool,

    /// Database name
    pub database: String,

    /// Basic auth user
    #[serde(default)]
    pub user: Option<String>,

    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,

    /// HTTP request timeout in seconds (default: 10)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_influx_host() -> String {
    "localhost".to_string()
}

fn default_influx_port() -> u16 {
    8086
}

impl InfluxConfig {
    /// Write endpoint URL.
    pub fn write_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}/write", scheme, self.host, self.port)
    }
}

/// Zenoh sink settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZenohSinkConfig {
    /// Session settings
    #[serde(flatten)]
    pub session: ZenohConfig,

    /// Key expression prefix (default: "diematic")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Payload format (default: "json")
    #[serde(default)]
    pub format: Format,
}

fn default_key_prefix() -> String {
    "diematic".to_string()
}

impl Default for ZenohSinkConfig {
    fn default() -> Self {
        Self {
            session: ZenohConfig::default(),
            key_prefix: default_key_prefix(),
            format: Format::default(),
        }
    }
}

impl DiematicBridgeConfig {
    /// Load configuration from a JSON5 file, apply command line overrides,
    /// then validate.
    pub fn load_from_file<P: AsRef<Path>>(
        path: P,
        device: Option<&str>,
        backend: Option<Backend>,
    ) -> Result<Self, ConfigError> {
        let mut config: DiematicBridgeConfig = diematic_common::load_config(path)?;
        config.apply_overrides(device, backend);
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: DiematicBridgeConfig = diematic_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the register schema.
    pub fn schema(&self) -> Result<Schema, SchemaError> {
        Schema::load(&self.registers)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.modbus.validate()?;
        self.schema()?;

        if self.publish.measurement.trim().is_empty() {
            return Err(ConfigError::Validation(
                "publish.measurement cannot be empty".to_string(),
            ));
        }

        if self.poll_interval_secs == Some(0) {
            return Err(ConfigError::Validation(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }

        match self.backend {
            Backend::Influxdb => match &self.influxdb {
                None => {
                    return Err(ConfigError::Validation(
                        "backend 'influxdb' requires an 'influxdb' section".to_string(),
                    ));
                }
                Some(influx) if influx.database.trim().is_empty() => {
                    return Err(ConfigError::Validation(
                        "influxdb.database cannot be empty".to_string(),
                    ));
                }
                Some(_) => {}
            },
            Backend::Zenoh => {
                if self.zenoh.key_prefix.is_empty() {
                    return Err(ConfigError::Validation(
                        "zenoh.key_prefix cannot be empty".to_string(),
                    ));
                }
                let key = build_key_expr(&self.zenoh.key_prefix, &self.publish.measurement);
                if let Err(e) = KeyExpr::try_from(key.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "invalid Zenoh key '{}' (check zenoh.key_prefix and publish.measurement): {}",
                        key, e
                    )));
                }
            }
            Backend::None => {}
        }

        Ok(())
    }

    /// Apply command line overrides.
    pub fn apply_overrides(&mut self, device: Option<&str>, backend: Option<Backend>) {
        if let Some(device) = device {
            self.modbus.device = Some(device.to_string());
        }
        if let Some(backend) = backend {
            self.backend = backend;
        }
    }

    /// Serial device, required before the first cycle.
    pub fn device(&self) -> Result<&str, ConfigError> {
        self.modbus
            .device
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| ConfigError::Validation("Modbus device not set".to_string()))
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_secs.map(Duration::from_secs)
    }
}
