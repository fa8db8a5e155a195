// Timeouts, topics, buffer limits and the per-sensor JSON configuration
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::axes::AxisMap;
use crate::chip::ChipKind;
use crate::error::{AccelError, Result};

// Standard gravity in mm/s^2 (all decoded samples use this unit)
pub const FREEFALL_ACCEL: f64 = 9.80665 * 1000.;

// Batch pipeline period
pub const BATCH_INTERVAL: Duration = Duration::from_millis(100);

// Lead time between "now" and the firmware start tick
pub const MIN_MSG_TIME: f64 = 0.100;

// Raw-block buffer cap; blocks beyond it are discarded and show up as drops
pub const MAX_BUFFERED_BLOCKS: usize = 300_000;

// Every firmware data block carries up to this many 6-byte samples
pub const BYTES_PER_SAMPLE: usize = 6;
pub const SAMPLES_PER_BLOCK: usize = 8;

// Instantaneous query polling
pub const QUERY_POLL_INTERVAL: Duration = Duration::from_millis(100);

// Zenoh topic prefix, one subtree per sensor name
pub const TOPIC_PREFIX: &str = "accel";

// Default serial port for the motion-control host link
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

pub fn topic(sensor: &str, leaf: &str) -> String {
    format!("{}/{}/{}", TOPIC_PREFIX, sensor, leaf)
}

/// Probe settings; only meaningful for chips with tap detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// "int1", "int2", optionally prefixed by "!" for active-low
    pub int_pin: String,
    /// Tap threshold in mm/s^2
    #[serde(default = "default_tap_thresh")]
    pub tap_thresh: f64,
    /// Tap duration in seconds
    #[serde(default = "default_tap_dur")]
    pub tap_dur: f64,
    /// Trigger offset reported with probe results (mm)
    #[serde(default)]
    pub z_offset: f64,
    #[serde(default = "default_retries")]
    pub calibration_retries: u32,
    /// Settling interval for each calibration attempt (seconds)
    #[serde(default = "default_calibration_time")]
    pub calibration_time: f64,
}

/// Sensor configuration as loaded from the JSON config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub chip: ChipKind,
    #[serde(default = "default_axes_map")]
    pub axes_map: String,
    /// Sample rate in Hz; defaults to the chip's preferred rate
    #[serde(default)]
    pub rate: Option<u32>,
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Firmware clock frequency in Hz
    #[serde(default = "default_mcu_freq")]
    pub mcu_frequency: f64,
    /// Firmware object id of the sensor
    #[serde(default)]
    pub oid: u8,
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    /// Seconds to wait for the first block of an instantaneous query
    #[serde(default = "default_query_timeout")]
    pub query_timeout: f64,
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
}

fn default_name() -> String {
    "default".to_string()
}
fn default_axes_map() -> String {
    "x,y,z".to_string()
}
fn default_port() -> String {
    DEFAULT_PORT.to_string()
}
fn default_baudrate() -> u32 {
    250_000
}
fn default_mcu_freq() -> f64 {
    16_000_000.
}
fn default_export_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_query_timeout() -> f64 {
    3.
}
fn default_tap_thresh() -> f64 {
    5000.
}
fn default_tap_dur() -> f64 {
    0.01
}
fn default_retries() -> u32 {
    3
}
fn default_calibration_time() -> f64 {
    1.
}

impl SensorConfig {
    /// Minimal configuration for a chip with every other field defaulted
    pub fn new(chip: ChipKind) -> Self {
        Self {
            name: default_name(),
            chip,
            axes_map: default_axes_map(),
            rate: None,
            port: default_port(),
            baudrate: default_baudrate(),
            mcu_frequency: default_mcu_freq(),
            oid: 0,
            export_dir: default_export_dir(),
            query_timeout: default_query_timeout(),
            probe: None,
        }
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: SensorConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject anything that would only fail later against hardware
    pub fn validate(&self) -> Result<()> {
        let info = self.chip.info();
        self.parsed_axes_map()?;
        let rate = self.rate();
        if !info.rate_supported(rate) {
            return Err(AccelError::Configuration(format!(
                "Invalid {} rate parameter: {}",
                info.name, rate
            )));
        }
        if !is_valid_name(&self.name) {
            return Err(AccelError::Configuration(format!(
                "Invalid sensor name '{}'",
                self.name
            )));
        }
        if self.mcu_frequency <= 0. || self.query_timeout <= 0. {
            return Err(AccelError::Configuration(
                "mcu_frequency and query_timeout must be positive".to_string(),
            ));
        }
        if let Some(probe) = &self.probe {
            let Some(tap) = &info.tap else {
                return Err(AccelError::Configuration(format!(
                    "{} does not support probing",
                    info.name
                )));
            };
            tap.check_thresh(probe.tap_thresh)?;
            tap.check_dur(probe.tap_dur)?;
            parse_int_pin(&probe.int_pin)?;
        }
        Ok(())
    }

    pub fn rate(&self) -> u32 {
        self.rate.unwrap_or(self.chip.info().default_rate)
    }

    pub fn parsed_axes_map(&self) -> Result<AxisMap> {
        AxisMap::parse(&self.axes_map, self.chip.info().scale)
    }
}

/// Parse an interrupt pin name into (use int2, inverted)
pub fn parse_int_pin(pin: &str) -> Result<(bool, bool)> {
    let pin = pin.trim();
    let (inverted, pin) = match pin.strip_prefix('!') {
        Some(rest) => (true, rest.trim()),
        None => (false, pin),
    };
    match pin {
        "int1" => Ok((false, inverted)),
        "int2" => Ok((true, inverted)),
        _ => Err(AccelError::Configuration(
            "int_pin must specify one of int1 or int2 pins".to_string(),
        )),
    }
}

/// Sensor and measurement names: alphanumerics plus '-' and '_'
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
