// Per-chip-family register maps and capabilities
//
// Provides:
// - ChipInfo: static description (identity, scale, rates, debug range)
// - AccelChip: the capability interface shared decode/sync/calibration code uses
// - TapProbe: extra capability of chips that can act as a contact probe

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AccelError, Result};
use crate::link::RegisterBus;

pub mod adxl345;
pub mod lis2dw;

pub use adxl345::Adxl345;
pub use lis2dw::Lis2dw;

/// Supported chip families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipKind {
    Adxl345,
    Lis2dw,
}

impl ChipKind {
    pub fn info(&self) -> &'static ChipInfo {
        match self {
            ChipKind::Adxl345 => &adxl345::INFO,
            ChipKind::Lis2dw => &lis2dw::INFO,
        }
    }

    pub fn build(&self) -> Box<dyn AccelChip> {
        match self {
            ChipKind::Adxl345 => Box::new(Adxl345),
            ChipKind::Lis2dw => Box::new(Lis2dw),
        }
    }
}

/// Tap-detection scales and limits
#[derive(Debug)]
pub struct TapInfo {
    /// mm/s^2 per threshold LSB
    pub tap_scale: f64,
    /// seconds per duration LSB
    pub dur_scale: f64,
    /// mm/s^2 per offset register LSB
    pub offset_scale: f64,
    pub max_tap_thresh: f64,
    pub max_tap_dur: f64,
    /// Offset registers in raw axis order
    pub offset_regs: [u8; 3],
}

impl TapInfo {
    pub fn check_thresh(&self, thresh: f64) -> Result<()> {
        if thresh < self.tap_scale || thresh > self.max_tap_thresh {
            return Err(AccelError::Configuration(format!(
                "tap_thresh {} out of range [{}, {}]",
                thresh, self.tap_scale, self.max_tap_thresh
            )));
        }
        Ok(())
    }

    pub fn check_dur(&self, dur: f64) -> Result<()> {
        if dur <= self.dur_scale || dur > self.max_tap_dur {
            return Err(AccelError::Configuration(format!(
                "tap_dur {} out of range ({}, {}]",
                dur, self.dur_scale, self.max_tap_dur
            )));
        }
        Ok(())
    }
}

/// Static description of a chip family
#[derive(Debug)]
pub struct ChipInfo {
    pub name: &'static str,
    pub id_reg: u8,
    pub dev_id: u8,
    /// mm/s^2 per LSB of a decoded sample
    pub scale: f64,
    /// Significant bits in each sample word (sign bit included)
    pub sample_bits: u32,
    /// Supported rates and their register codes
    pub rates: &'static [(u32, u8)],
    pub default_rate: u32,
    /// Registers open to debug reads and writes
    pub debug_regs: RangeInclusive<u8>,
    pub tap: Option<TapInfo>,
}

impl ChipInfo {
    pub fn rate_code(&self, rate: u32) -> Option<u8> {
        self.rates
            .iter()
            .find(|&&(r, _)| r == rate)
            .map(|&(_, code)| code)
    }

    pub fn rate_supported(&self, rate: u32) -> bool {
        self.rate_code(rate).is_some()
    }
}

/// Tap-probe settings written before calibration
#[derive(Debug, Clone, Copy)]
pub struct TapSettings {
    pub int2: bool,
    pub inverted: bool,
    pub tap_thresh: f64,
    pub tap_dur: f64,
}

/// Capability interface implemented once per chip family
pub trait AccelChip: Send {
    fn info(&self) -> &'static ChipInfo;

    fn read_register(&self, bus: &mut dyn RegisterBus, reg: u8) -> Result<u8> {
        Ok(bus.read_register(reg)?)
    }

    /// Write a register and verify it by reading it back
    fn write_register(
        &self,
        bus: &mut dyn RegisterBus,
        reg: u8,
        value: u8,
        min_clock: u64,
    ) -> Result<()> {
        set_reg(bus, self.info(), reg, value, min_clock)
    }

    /// Check the identity register
    fn identify(&self, bus: &mut dyn RegisterBus) -> Result<()> {
        let info = self.info();
        let dev_id = bus.read_register(info.id_reg).map_err(|e| {
            AccelError::Connectivity(format!("Unable to read {} id: {}", info.name, e))
        })?;
        debug!("{} dev_id: {:#x}", info.name, dev_id);
        if dev_id != info.dev_id {
            return Err(AccelError::Connectivity(format!(
                "Invalid {} id (got {:x} vs {:x}).",
                info.name, dev_id, info.dev_id
            )));
        }
        Ok(())
    }

    /// Put the chip into streaming mode at `rate` (already validated)
    fn configure_rate(&self, bus: &mut dyn RegisterBus, rate: u32, min_clock: u64) -> Result<()>;

    /// Register cleanup after the firmware stopped streaming
    fn finish(&self, _bus: &mut dyn RegisterBus) -> Result<()> {
        Ok(())
    }

    fn tap_probe(&self) -> Option<&dyn TapProbe> {
        None
    }
}

/// Contact-probe capability (tap interrupt plus offset registers)
pub trait TapProbe {
    /// Power down, configure tap detection and zero the offsets
    fn configure_tap(&self, bus: &mut dyn RegisterBus, settings: &TapSettings) -> Result<()>;

    /// Write offsets in raw axis order
    fn write_offsets(&self, bus: &mut dyn RegisterBus, offsets: [i8; 3]) -> Result<()>;

    /// Enable the single-tap interrupt (and power up when not streaming)
    fn arm(&self, bus: &mut dyn RegisterBus, measuring: bool, min_clock: u64) -> Result<()>;

    /// Disable the single-tap interrupt (and power down when not streaming)
    fn disarm(&self, bus: &mut dyn RegisterBus, measuring: bool, min_clock: u64) -> Result<()>;

    /// Whether a tap event is currently latched
    fn tap_latched(&self, bus: &mut dyn RegisterBus) -> Result<bool>;

    /// Write tap threshold (mm/s^2) and duration (s), already range-checked
    fn set_tap_params(&self, bus: &mut dyn RegisterBus, thresh: f64, dur: f64) -> Result<()>;
}

/// Verified register write shared by all chip families
pub fn set_reg(
    bus: &mut dyn RegisterBus,
    info: &ChipInfo,
    reg: u8,
    value: u8,
    min_clock: u64,
) -> Result<()> {
    bus.write_register(reg, value, min_clock)?;
    let stored = bus.read_register(reg)?;
    if stored != value {
        return Err(AccelError::Connectivity(format!(
            "Failed to set {} register [{:#x}] to {:#x}: got {:#x}.",
            info.name, reg, value, stored
        )));
    }
    Ok(())
}
