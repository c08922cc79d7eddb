//! Charger and battery configuration.
//!
//! Loaded from YAML and checked with [`ChargerConfig::validate`] before any
//! runtime object is built. Every violation is fatal at startup.

use crate::protocol::{FrameId, Protocol, MAX_FRAME_ID, MAX_HEARTBEAT_ID, MAX_PAYLOAD};
use crate::Error;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::time::Duration;

pub const MAX_BATTERIES: usize = 4;
/// Upper bound of a per-battery current cap, in amperes.
pub const MAX_CURRENT_CAP: f32 = 100.0;

/// A CAN id written either as a YAML integer or as a `0x` prefixed string.
pub fn parse_id(text: &str) -> Result<FrameId, Error> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    let id = parsed.map_err(|_| Error::InvalidId(text.to_string()))?;
    if id > MAX_FRAME_ID as u32 {
        return Err(Error::IdRange(id));
    }
    Ok(id as FrameId)
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<FrameId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u32),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) if id <= MAX_FRAME_ID as u32 => Ok(id as FrameId),
        RawId::Number(id) => Err(serde::de::Error::custom(Error::IdRange(id))),
        RawId::Text(text) => parse_id(&text).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatteryConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// CAN interface the BMS is attached to.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(
        default = "BatteryConfig::default_heartbeat_id",
        deserialize_with = "deserialize_id"
    )]
    pub heartbeat_id: FrameId,
    #[serde(default = "BatteryConfig::default_heartbeat_text")]
    pub heartbeat_text: String,
    /// Values of a frame id not seen for this long become unknown.
    #[serde(default = "BatteryConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Caps the charge current limit reported by the BMS.
    #[serde(default)]
    pub max_charge_current: Option<f32>,
    /// Caps the discharge current limit reported by the BMS.
    #[serde(default)]
    pub max_discharge_current: Option<f32>,
}

impl BatteryConfig {
    fn default_heartbeat_id() -> FrameId {
        0x308
    }

    fn default_heartbeat_text() -> String {
        "ESPHome".into()
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(60)
    }

    /// Configured name, or `battery<N>` counting from one.
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("battery{}", index + 1))
    }

    fn validate(&self, name: &str) -> Result<(), Error> {
        if self.heartbeat_id > MAX_HEARTBEAT_ID {
            return Err(Error::HeartbeatIdRange {
                name: name.to_string(),
                id: self.heartbeat_id,
            });
        }
        let len = self.heartbeat_text.chars().count();
        if !(1..=MAX_PAYLOAD).contains(&len) {
            return Err(Error::HeartbeatTextLength {
                name: name.to_string(),
                len,
            });
        }
        if !self.heartbeat_text.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::HeartbeatTextCharset {
                name: name.to_string(),
                text: self.heartbeat_text.clone(),
            });
        }
        if self.timeout.is_zero() {
            return Err(Error::ZeroDuration("battery timeout"));
        }
        for cap in [self.max_charge_current, self.max_discharge_current]
            .into_iter()
            .flatten()
        {
            if !(0.0..=MAX_CURRENT_CAP).contains(&cap) {
                return Err(Error::CurrentCap {
                    name: name.to_string(),
                    value: cap,
                });
            }
        }
        Ok(())
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            name: None,
            interface: None,
            heartbeat_id: Self::default_heartbeat_id(),
            heartbeat_text: Self::default_heartbeat_text(),
            timeout: Self::default_timeout(),
            max_charge_current: None,
            max_discharge_current: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChargerConfig {
    #[serde(default = "ChargerConfig::default_name")]
    pub name: String,
    pub protocol: Protocol,
    /// Poll tick period.
    #[serde(default = "ChargerConfig::default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// A battery without any frame for this long is disconnected.
    #[serde(default = "ChargerConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Unchanged values are republished at most this often.
    #[serde(default = "ChargerConfig::default_throttle", with = "humantime_serde")]
    pub throttle: Duration,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "ChargerConfig::default_zero_limits")]
    pub zero_limits_when_disconnected: bool,
    pub batteries: Vec<BatteryConfig>,
}

impl ChargerConfig {
    fn default_name() -> String {
        "BmsCharger".into()
    }

    fn default_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_throttle() -> Duration {
        Duration::from_secs(15)
    }

    fn default_zero_limits() -> bool {
        true
    }

    pub const DEFAULT_CONFIG_FILE: &str = "canbms.yaml";

    pub fn new(protocol: Protocol, batteries: Vec<BatteryConfig>) -> Self {
        Self {
            name: Self::default_name(),
            protocol,
            interval: Self::default_interval(),
            timeout: Self::default_timeout(),
            throttle: Self::default_throttle(),
            debug: false,
            zero_limits_when_disconnected: Self::default_zero_limits(),
            batteries,
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(config_file_path: &str) -> Result<Self, Error> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)?;
        let config: Self = serde_yaml::from_reader(&config_file)?;
        config.validate()?;
        Ok(config)
    }

    /// Interface of every battery. Each battery needs a bus of its own,
    /// separate from the inverter bus on `inverter`.
    pub fn battery_interfaces(&self, inverter: &str) -> Result<Vec<String>, Error> {
        let mut interfaces: Vec<String> = Vec::new();
        for (index, battery) in self.batteries.iter().enumerate() {
            let name = battery.display_name(index);
            let interface = battery
                .interface
                .clone()
                .ok_or_else(|| Error::MissingInterface(name.clone()))?;
            if interface == inverter || interfaces.contains(&interface) {
                return Err(Error::SharedInterface { name, interface });
            }
            interfaces.push(interface);
        }
        Ok(interfaces)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.batteries.is_empty() {
            return Err(Error::NoBatteries);
        }
        if self.batteries.len() > MAX_BATTERIES {
            return Err(Error::TooManyBatteries {
                count: self.batteries.len(),
                max: MAX_BATTERIES,
            });
        }
        if self.interval.is_zero() {
            return Err(Error::ZeroDuration("interval"));
        }
        if self.timeout.is_zero() {
            return Err(Error::ZeroDuration("timeout"));
        }
        let mut names = HashSet::new();
        for (index, battery) in self.batteries.iter().enumerate() {
            let name = battery.display_name(index);
            battery.validate(&name)?;
            if !names.insert(name.clone()) {
                return Err(Error::DuplicateBattery(name));
            }
        }
        Ok(())
    }
}
