//! YAML configuration.
//!
//! ```yaml
//! name: victron-energymeter-mqtt
//! loglevel: info
//! mqtt:
//!   broker: 192.168.1.119
//!   topic: stromzaehler/#
//! factors:
//!   imported: 1.0
//!   exported: 1.0
//! l1:
//!   voltage: 230
//!   topic:
//!     power: L1/Power
//!     imported: L1/Import
//! ```

use crate::error::ConfigError;
use crate::phase::{PhaseLine, TopicBindings};
use serde_derive::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::level_filters::LevelFilter;

pub const CONFIG_ENV: &str = "BRIDGE_CONFIG";
pub const CONFIG_LOCATIONS: [&str; 3] = [
    "/etc/victron-mqtt-bridge.yaml",
    "/data/victron-mqtt-bridge.yaml",
    "./victron-mqtt-bridge.yaml",
];

const DEFAULT_LOG_INTERVAL_SECS: u64 = 3600;

/// What happens to a current or power value estimated from the other
/// readings once it has been published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedValues {
    /// Reset to zero after publication.
    #[default]
    Transient,
    /// Kept until a real reading replaces it.
    Sticky,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub dryrun: bool,
    pub loglevel: String,
    pub loginterval: u64,
    pub derived: DerivedValues,
    pub mqtt: MqttConfig,
    pub factors: FactorConfig,
    pub modbus: ModbusConfig,
    pub l1: Option<PhaseConfig>,
    pub l2: Option<PhaseConfig>,
    pub l3: Option<PhaseConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "victron-energymeter-mqtt".to_string(),
            dryrun: false,
            loglevel: "info".to_string(),
            loginterval: DEFAULT_LOG_INTERVAL_SECS,
            derived: DerivedValues::default(),
            mqtt: MqttConfig::default(),
            factors: FactorConfig::default(),
            modbus: ModbusConfig::default(),
            l1: None,
            l2: None,
            l3: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub user: String,
    pub password: String,
    pub topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "victron-em-bridge".to_string(),
            user: String::new(),
            password: String::new(),
            topic: "stromzaehler/#".to_string(),
        }
    }
}

/// Multipliers applied to energy counters (CT ratio, meter constant).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct FactorConfig {
    pub imported: f64,
    pub exported: f64,
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            imported: 1.0,
            exported: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub listen: Option<SocketAddr>,
}

/// Seed values and topic bindings of one phase.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub imported: f64,
    pub exported: f64,
    pub topic: TopicBindings,
}

impl PhaseConfig {
    pub fn into_phase(self, name: impl Into<String>) -> PhaseLine {
        let mut line = PhaseLine::new(name, self.topic);
        line.voltage = self.voltage;
        line.current = self.current;
        line.power = self.power;
        line.imported = self.imported;
        line.exported = self.exported;
        line
    }
}

impl Config {
    /// Loads from `$BRIDGE_CONFIG`, else the first existing default location.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| {
                    ConfigError::NotFound(CONFIG_LOCATIONS.iter().map(|s| s.to_string()).collect())
                })?,
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(contents)?;
        config.fix_values();
        config.validate()?;
        Ok(config)
    }

    fn fix_values(&mut self) {
        if self.loginterval == 0 {
            self.loginterval = DEFAULT_LOG_INTERVAL_SECS;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.l1.is_none() {
            return Err(ConfigError::MissingFirstPhase);
        }
        if self.l3.is_some() && self.l2.is_none() {
            return Err(ConfigError::PhaseGap(3, 2));
        }
        if !self.factors.imported.is_finite() {
            return Err(ConfigError::InvalidFactor("imported"));
        }
        if !self.factors.exported.is_finite() {
            return Err(ConfigError::InvalidFactor("exported"));
        }
        self.log_level()?;
        Ok(())
    }

    /// Phases named L1..Ln in configuration order.
    pub fn phases(&self) -> Vec<PhaseLine> {
        [&self.l1, &self.l2, &self.l3]
            .into_iter()
            .map_while(|phase| phase.clone())
            .enumerate()
            .map(|(i, phase)| phase.into_phase(format!("L{}", i + 1)))
            .collect()
    }

    pub fn log_level(&self) -> Result<LevelFilter, ConfigError> {
        match self.loglevel.to_ascii_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            "off" => Ok(LevelFilter::OFF),
            _ => Err(ConfigError::InvalidLogLevel(self.loglevel.clone())),
        }
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.loginterval)
    }
}
