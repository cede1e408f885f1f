// Timeouts, topics, controller configuration
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::motor::roboclaw::{Address, DEFAULT_BAUDRATE};
use crate::motor::{Channel, PositionCommand};
use crate::telemetry::DEFAULT_RADIANS_PER_TURN;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 10;

// Diagnostics refresh frequency
pub const DIAGNOSTICS_HZ: u64 = 1;

// Command timeout for watchdog
pub const DEFAULT_WATCHDOG_MS: u64 = 1000;

// Zenoh topics
pub const TOPIC_CMD_JOINT: &str = "roboclaw/cmd/joint"; // commands
pub const TOPIC_RT_JOINTS: &str = "roboclaw/state/joints"; // joint angles
pub const TOPIC_HEALTH: &str = "roboclaw/state/health"; // watchdog status
pub const TOPIC_DIAGNOSTICS: &str = "roboclaw/state/diagnostics"; // controller vitals
pub const TOPIC_HOME: &str = "roboclaw/srv/home"; // homing queryable

// Controller defaults
pub const DEFAULT_DEVICE: &str = "/dev/ttyACM0";
pub const DEFAULT_ADDRESS: u8 = 0x80;
pub const DEFAULT_REDUCTION_RATIO: f64 = 5281.1;

#[derive(Debug, Parser)]
#[command(name = "roboclaw-arm-runtime", version, about = "Watchdog, telemetry and homing for a RoboClaw-driven arm")]
pub struct Cli {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Serial device of the controller
    #[arg(long)]
    pub device: Option<String>,

    #[arg(long)]
    pub baud: Option<u32>,

    /// Packet serial address, decimal (128) or hex (0x80)
    #[arg(long, value_parser = parse_address)]
    pub address: Option<u8>,

    /// Stop the motors when no command arrives for this long
    #[arg(long)]
    pub watchdog_ms: Option<u64>,

    /// Run against a simulated controller instead of the serial device
    #[arg(long)]
    pub simulate: bool,
}

fn parse_address(raw: &str) -> std::result::Result<u8, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", raw, e))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JointConfig {
    pub id: u8,
    pub channel: Channel,
    pub reduction_ratio: f64,
    /// Angle reported for one output revolution
    #[serde(default = "default_radians_per_turn")]
    pub radians_per_turn: f64,
}

fn default_radians_per_turn() -> f64 {
    DEFAULT_RADIANS_PER_TURN
}

/// Speed/accel profile applied to every position command
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionProfile {
    pub accel: u32,
    pub speed: u32,
    pub decel: u32,
    pub buffer: u8,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            accel: 100,
            speed: 10_000,
            decel: 100,
            buffer: 0,
        }
    }
}

impl MotionProfile {
    pub fn to(&self, target: i32) -> PositionCommand {
        PositionCommand {
            accel: self.accel,
            speed: self.speed,
            decel: self.decel,
            target,
            buffer: self.buffer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HomingSettings {
    /// Magnitude of the backward drive, 1..=127
    pub duty: i8,
    pub poll_hz: u64,
    /// Give up on a joint after this long; null waits forever
    pub timeout_ms: Option<u64>,
}

impl Default for HomingSettings {
    fn default() -> Self {
        Self {
            duty: 63,
            poll_hz: 10,
            timeout_ms: Some(30_000),
        }
    }
}

impl HomingSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.poll_hz.max(1))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub device: String,
    pub baudrate: u32,
    pub address: u8,
    pub joints: Vec<JointConfig>,
    pub watchdog_timeout_ms: u64,
    pub motion: MotionProfile,
    pub homing: HomingSettings,
    pub simulate: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            address: DEFAULT_ADDRESS,
            joints: vec![
                JointConfig {
                    id: 0,
                    channel: Channel::M1,
                    reduction_ratio: DEFAULT_REDUCTION_RATIO,
                    radians_per_turn: DEFAULT_RADIANS_PER_TURN,
                },
                JointConfig {
                    id: 1,
                    channel: Channel::M2,
                    reduction_ratio: DEFAULT_REDUCTION_RATIO,
                    radians_per_turn: DEFAULT_RADIANS_PER_TURN,
                },
            ],
            watchdog_timeout_ms: DEFAULT_WATCHDOG_MS,
            motion: MotionProfile::default(),
            homing: HomingSettings::default(),
            simulate: false,
        }
    }
}

impl RuntimeConfig {
    /// Read the optional config file, apply command-line overrides, validate
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    Error::Configuration(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_json(&text)?
            }
            None => Self::default(),
        };

        if let Some(device) = &cli.device {
            config.device = device.clone();
        }
        if let Some(baud) = cli.baud {
            config.baudrate = baud;
        }
        if let Some(address) = cli.address {
            config.address = address;
        }
        if let Some(ms) = cli.watchdog_ms {
            config.watchdog_timeout_ms = ms;
        }
        config.simulate |= cli.simulate;

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::Configuration(format!("invalid configuration: {}", e)))
    }

    pub fn validate(&self) -> Result<Address> {
        let address = Address::new(self.address)?;

        if self.watchdog_timeout_ms == 0 {
            return Err(Error::Configuration("watchdog timeout must be positive".into()));
        }
        if self.joints.is_empty() {
            return Err(Error::Configuration("no joints configured".into()));
        }

        let mut ids = HashSet::new();
        let mut channels = HashSet::new();
        for joint in &self.joints {
            if !(joint.reduction_ratio.is_finite() && joint.reduction_ratio > 0.0) {
                return Err(Error::Configuration(format!(
                    "joint {}: reduction ratio must be positive, got {}",
                    joint.id, joint.reduction_ratio
                )));
            }
            if !(joint.radians_per_turn.is_finite() && joint.radians_per_turn > 0.0) {
                return Err(Error::Configuration(format!(
                    "joint {}: radians per turn must be positive, got {}",
                    joint.id, joint.radians_per_turn
                )));
            }
            if !ids.insert(joint.id) {
                return Err(Error::Configuration(format!("joint {} configured twice", joint.id)));
            }
            if !channels.insert(joint.channel) {
                return Err(Error::Configuration(format!(
                    "channel {} drives more than one joint",
                    joint.channel
                )));
            }
        }

        if self.homing.duty <= 0 {
            return Err(Error::Configuration("homing duty must be in 1..=127".into()));
        }
        if self.homing.poll_hz == 0 {
            return Err(Error::Configuration("homing poll rate must be positive".into()));
        }

        Ok(address)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["roboclaw-arm-runtime"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert_eq!(config.validate().unwrap().get(), 0x80);
        assert_eq!(config.watchdog_timeout(), Duration::from_secs(1));
        assert_eq!(config.homing.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_address_out_of_range_is_fatal() {
        let err = RuntimeConfig::load(&cli(&["--address", "0x88"])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = RuntimeConfig::load(&cli(&["--address", "127"])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_address_accepts_hex_and_decimal() {
        assert_eq!(parse_address("0x85"), Ok(0x85));
        assert_eq!(parse_address("130"), Ok(130));
        assert!(parse_address("0x1FF").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config =
            RuntimeConfig::load(&cli(&["--device", "/dev/ttyUSB1", "--watchdog-ms", "250", "--simulate"]))
                .unwrap();
        assert_eq!(config.device, "/dev/ttyUSB1");
        assert_eq!(config.watchdog_timeout_ms, 250);
        assert!(config.simulate);
    }

    #[test]
    fn test_json_config() {
        let config = RuntimeConfig::from_json(
            r#"{
                "device": "/dev/ttyACM1",
                "address": 129,
                "joints": [
                    {"id": 2, "channel": "M2", "reduction_ratio": 1000.0}
                ],
                "homing": {"timeout_ms": null}
            }"#,
        )
        .unwrap();
        assert_eq!(config.address, 0x81);
        assert_eq!(config.joints.len(), 1);
        assert_eq!(config.joints[0].channel, Channel::M2);
        assert_eq!(config.joints[0].radians_per_turn, DEFAULT_RADIANS_PER_TURN);
        assert_eq!(config.homing.timeout(), None);
        assert_eq!(config.homing.duty, 63);
        assert_eq!(config.baudrate, DEFAULT_BAUDRATE);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_joints_rejected() {
        let mut config = RuntimeConfig::default();
        config.joints[1].reduction_ratio = 0.0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.joints[1].channel = Channel::M1;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.joints[1].id = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.joints[0].radians_per_turn = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(RuntimeConfig::from_json(r#"{"adress": 128}"#).is_err());
    }
}
