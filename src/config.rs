//! Configuration loading.
//!
//! ```json
//! {
//!   "model": "zimmer2_finger",
//!   "endpoint": { "tcp": { "host": "192.168.3.112", "port": 502 } },
//!   "timing": { "poll_interval_ms": 10, "step_timeout_ms": 3000 }
//! }
//! ```
//!
//! Everything except `model` is optional and falls back to the model's
//! defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::handshake::Timing;
use crate::register_map::{koras, CommandLayout, DeviceDescriptor, Model};

/// Where the gripper is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Serial { path: String, baud_rate: u32 },
}

impl Endpoint {
    pub fn default_for(model: Model) -> Self {
        match model {
            Model::Zimmer2Finger | Model::Zimmer3Finger => Endpoint::Tcp {
                host: "192.168.3.112".into(),
                port: 502,
            },
            Model::Koras => Endpoint::Serial {
                path: "/dev/ttyUSB0".into(),
                baud_rate: koras::DEFAULT_BAUD_RATE,
            },
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_step_timeout_ms() -> u64 {
    3_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_io_timeout_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

/// Poll cadence, deadlines and retry budget, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            max_attempts: default_max_attempts(),
            io_timeout_ms: default_io_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl TimingConfig {
    pub fn handshake(&self) -> Timing {
        Timing {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            max_attempts: self.max_attempts,
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.step_timeout_ms < self.poll_interval_ms {
            return Err(ConfigError::Invalid(
                "step_timeout_ms must not be shorter than poll_interval_ms".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.io_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GripperConfig {
    pub model: Model,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    /// Overrides the descriptor's unit id.
    #[serde(default)]
    pub unit_id: Option<u8>,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Replaces the built-in register map, e.g. with one checked against a
    /// newer device manual.
    #[serde(default)]
    pub descriptor: Option<DeviceDescriptor>,
}

impl GripperConfig {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            endpoint: None,
            unit_id: None,
            timing: TimingConfig::default(),
            descriptor: None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: GripperConfig = serde_json::from_str(json)?;
        config.timing.validate()?;
        if let Some(descriptor) = &config.descriptor {
            if descriptor.model != config.model {
                return Err(ConfigError::Invalid(format!(
                    "descriptor is for {}, config selects {}",
                    descriptor.model, config.model
                )));
            }
            if descriptor.layout == CommandLayout::ProcessData {
                for (name, range) in [
                    ("force_range", descriptor.force_range),
                    ("velocity_range", descriptor.velocity_range),
                ] {
                    if range.max > u16::from(u8::MAX) {
                        return Err(ConfigError::Invalid(format!(
                            "{name} up to {} does not fit the process data byte",
                            range.max
                        )));
                    }
                }
            }
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
            .clone()
            .unwrap_or_else(|| Endpoint::default_for(self.model))
    }

    /// The register map in effect, with the unit id override applied.
    pub fn descriptor(&self) -> DeviceDescriptor {
        let mut descriptor = self
            .descriptor
            .clone()
            .unwrap_or_else(|| self.model.descriptor());
        if let Some(unit_id) = self.unit_id {
            descriptor.unit_id = unit_id;
        }
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_map::{zimmer, Bounds};

    #[test]
    fn minimal_config_uses_model_defaults() {
        let config = GripperConfig::from_json_str(r#"{ "model": "zimmer2_finger" }"#).unwrap();
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(
            config.endpoint(),
            Endpoint::Tcp {
                host: "192.168.3.112".into(),
                port: 502
            }
        );
        assert_eq!(config.descriptor().unit_id, zimmer::DEFAULT_UNIT_ID);
    }

    #[test]
    fn overrides() {
        let config = GripperConfig::from_json_str(
            r#"{
                "model": "koras",
                "endpoint": { "tcp": { "host": "10.0.0.7", "port": 5020 } },
                "unit_id": 3,
                "timing": { "poll_interval_ms": 20, "max_attempts": 5 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.descriptor().unit_id, 3);
        assert_eq!(config.timing.poll_interval_ms, 20);
        assert_eq!(config.timing.step_timeout_ms, 3_000);
        assert_eq!(config.timing.handshake().max_attempts, 5);
        assert!(matches!(config.endpoint(), Endpoint::Tcp { port: 5020, .. }));
    }

    #[test]
    fn rejects_bad_timing_and_mismatched_descriptor() {
        let err = GripperConfig::from_json_str(
            r#"{ "model": "koras", "timing": { "max_attempts": 0 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut config = GripperConfig::new(Model::Koras);
        config.descriptor = Some(Model::Zimmer2Finger.descriptor());
        let json = serde_json::to_string(&config).unwrap();
        assert!(matches!(
            GripperConfig::from_json_str(&json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn process_data_ranges_must_fit_a_byte() {
        let mut config = GripperConfig::new(Model::Zimmer2Finger);
        let mut descriptor = Model::Zimmer2Finger.descriptor();
        descriptor.velocity_range = Bounds::new(1, 256);
        config.descriptor = Some(descriptor);
        let json = serde_json::to_string(&config).unwrap();
        let err = GripperConfig::from_json_str(&json).unwrap_err();
        assert!(matches!(&err, ConfigError::Invalid(msg) if msg.starts_with("velocity_range")), "{err:?}");

        // order/value devices carry the whole word
        let mut config = GripperConfig::new(Model::Koras);
        let mut descriptor = Model::Koras.descriptor();
        descriptor.force_range = Bounds::new(50, 1000);
        config.descriptor = Some(descriptor);
        let json = serde_json::to_string(&config).unwrap();
        assert!(GripperConfig::from_json_str(&json).is_ok());
    }

    #[test]
    fn unknown_model_is_a_parse_error() {
        assert!(matches!(
            GripperConfig::from_json_str(r#"{ "model": "robotiq" }"#),
            Err(ConfigError::Json(_))
        ));
    }
}
