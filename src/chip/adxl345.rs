// ADXL345 register map and capabilities
//
// Streams over the firmware bulk query at 25..3200 Hz and doubles as a
// tap-triggered contact probe.

use tracing::{debug, info};

use super::{set_reg, AccelChip, ChipInfo, TapInfo, TapProbe, TapSettings};
use crate::config::FREEFALL_ACCEL;
use crate::error::Result;
use crate::link::RegisterBus;

/// Register addresses
pub const REG_DEVID: u8 = 0x00;
pub const REG_THRESH_TAP: u8 = 0x1D;
pub const REG_OFSX: u8 = 0x1E;
pub const REG_OFSY: u8 = 0x1F;
pub const REG_OFSZ: u8 = 0x20;
pub const REG_DUR: u8 = 0x21;
pub const REG_TAP_AXES: u8 = 0x2A;
pub const REG_BW_RATE: u8 = 0x2C;
pub const REG_POWER_CTL: u8 = 0x2D;
pub const REG_INT_ENABLE: u8 = 0x2E;
pub const REG_INT_MAP: u8 = 0x2F;
pub const REG_INT_SOURCE: u8 = 0x30;
pub const REG_DATA_FORMAT: u8 = 0x31;
pub const REG_FIFO_CTL: u8 = 0x38;

pub const DEV_ID: u8 = 0xE5;

// Full resolution, +-16g
const DATA_FORMAT_FULL_RES: u8 = 0x0B;
// Same with active-low interrupts
const DATA_FORMAT_INVERTED: u8 = 0x2B;
const POWER_CTL_MEASURE: u8 = 0x08;
const FIFO_STREAM: u8 = 0x80;
const INT_SINGLE_TAP: u8 = 0x40;
const INT_MAP_INT2: u8 = 0x40;
const TAP_AXES_ALL: u8 = 0x07;

/// Reads of INT_SOURCE allowed for a latched tap to clear
const CLEAR_TAP_TRIES: usize = 8;

// 3.9mg/LSB
const SCALE: f64 = 0.0039 * FREEFALL_ACCEL;

const QUERY_RATES: [(u32, u8); 8] = [
    (25, 0x8),
    (50, 0x9),
    (100, 0xA),
    (200, 0xB),
    (400, 0xC),
    (800, 0xD),
    (1600, 0xE),
    (3200, 0xF),
];

pub static INFO: ChipInfo = ChipInfo {
    name: "adxl345",
    id_reg: REG_DEVID,
    dev_id: DEV_ID,
    scale: SCALE,
    sample_bits: 16,
    rates: &QUERY_RATES,
    default_rate: 3200,
    debug_regs: 0x1D..=0x39,
    tap: Some(TapInfo {
        // 62.5mg/LSB
        tap_scale: 0.0625 * FREEFALL_ACCEL,
        // 0.625 msec/LSB
        dur_scale: 0.000625,
        // 15.6mg/LSB
        offset_scale: 0.0156 * FREEFALL_ACCEL,
        max_tap_thresh: 100_000.,
        max_tap_dur: 0.1,
        offset_regs: [REG_OFSX, REG_OFSY, REG_OFSZ],
    }),
};

pub struct Adxl345;

impl Adxl345 {
    fn is_initialized(&self, bus: &mut dyn RegisterBus) -> Result<bool> {
        Ok(bus.read_register(REG_DEVID)? == DEV_ID
            && bus.read_register(REG_DATA_FORMAT)? & DATA_FORMAT_FULL_RES != 0)
    }

    fn initialize(&self, bus: &mut dyn RegisterBus) -> Result<()> {
        set_reg(bus, &INFO, REG_POWER_CTL, 0x00, 0)?;
        self.identify(bus)?;
        set_reg(bus, &INFO, REG_DATA_FORMAT, DATA_FORMAT_FULL_RES, 0)
    }

    fn ensure_initialized(&self, bus: &mut dyn RegisterBus) -> Result<()> {
        if !self.is_initialized(bus)? {
            info!("Initializing adxl345");
            self.initialize(bus)?;
        }
        Ok(())
    }
}

impl AccelChip for Adxl345 {
    fn info(&self) -> &'static ChipInfo {
        &INFO
    }

    fn configure_rate(&self, bus: &mut dyn RegisterBus, rate: u32, min_clock: u64) -> Result<()> {
        self.ensure_initialized(bus)?;
        let code = INFO.rate_code(rate).unwrap_or(0xF);
        set_reg(bus, &INFO, REG_POWER_CTL, 0x00, min_clock)?;
        set_reg(bus, &INFO, REG_FIFO_CTL, 0x00, 0)?;
        set_reg(bus, &INFO, REG_BW_RATE, code, 0)?;
        set_reg(bus, &INFO, REG_FIFO_CTL, FIFO_STREAM, 0)
    }

    fn tap_probe(&self) -> Option<&dyn TapProbe> {
        Some(self)
    }
}

impl TapProbe for Adxl345 {
    fn configure_tap(&self, bus: &mut dyn RegisterBus, settings: &TapSettings) -> Result<()> {
        let Some(tap) = &INFO.tap else {
            return Ok(());
        };
        self.ensure_initialized(bus)?;
        set_reg(bus, &INFO, REG_POWER_CTL, 0x00, 0)?;
        if settings.inverted {
            set_reg(bus, &INFO, REG_DATA_FORMAT, DATA_FORMAT_INVERTED, 0)?;
        }
        let int_map = if settings.int2 { INT_MAP_INT2 } else { 0x00 };
        set_reg(bus, &INFO, REG_INT_MAP, int_map, 0)?;
        set_reg(bus, &INFO, REG_TAP_AXES, TAP_AXES_ALL, 0)?;
        self.set_tap_params(bus, settings.tap_thresh, settings.tap_dur)?;
        for &reg in &tap.offset_regs {
            set_reg(bus, &INFO, reg, 0x00, 0)?;
        }
        Ok(())
    }

    fn write_offsets(&self, bus: &mut dyn RegisterBus, offsets: [i8; 3]) -> Result<()> {
        for (reg, value) in [REG_OFSX, REG_OFSY, REG_OFSZ].into_iter().zip(offsets) {
            debug!("adxl345 offset reg {:#x} = {}", reg, value);
            set_reg(bus, &INFO, reg, value as u8, 0)?;
        }
        Ok(())
    }

    fn arm(&self, bus: &mut dyn RegisterBus, measuring: bool, min_clock: u64) -> Result<()> {
        self.ensure_initialized(bus)?;
        set_reg(bus, &INFO, REG_INT_ENABLE, 0x00, min_clock)?;
        bus.read_register(REG_INT_SOURCE)?;
        set_reg(bus, &INFO, REG_INT_ENABLE, INT_SINGLE_TAP, min_clock)?;
        if !measuring {
            set_reg(bus, &INFO, REG_POWER_CTL, POWER_CTL_MEASURE, min_clock)?;
        }
        Ok(())
    }

    fn disarm(&self, bus: &mut dyn RegisterBus, measuring: bool, min_clock: u64) -> Result<()> {
        set_reg(bus, &INFO, REG_INT_ENABLE, 0x00, min_clock)?;
        if !measuring {
            set_reg(bus, &INFO, REG_POWER_CTL, 0x00, 0)?;
        }
        Ok(())
    }

    fn tap_latched(&self, bus: &mut dyn RegisterBus) -> Result<bool> {
        for _ in 0..CLEAR_TAP_TRIES {
            if bus.read_register(REG_INT_SOURCE)? & INT_SINGLE_TAP == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn set_tap_params(&self, bus: &mut dyn RegisterBus, thresh: f64, dur: f64) -> Result<()> {
        let Some(tap) = &INFO.tap else {
            return Ok(());
        };
        set_reg(bus, &INFO, REG_THRESH_TAP, (thresh / tap.tap_scale) as u8, 0)?;
        set_reg(bus, &INFO, REG_DUR, (dur / tap.dur_scale) as u8, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::sim::SimulatedFirmware;

    #[test]
    fn test_rate_table() {
        assert_eq!(INFO.rate_code(3200), Some(0xF));
        assert_eq!(INFO.rate_code(25), Some(0x8));
        assert_eq!(INFO.rate_code(1234), None);
    }

    #[test]
    fn test_configure_rate_writes_registers() {
        let mut sim = SimulatedFirmware::new(&INFO);
        Adxl345.configure_rate(&mut sim, 1600, 0).unwrap();
        assert_eq!(sim.register(REG_BW_RATE), 0xE);
        assert_eq!(sim.register(REG_FIFO_CTL), FIFO_STREAM);
        assert_eq!(sim.register(REG_DATA_FORMAT), DATA_FORMAT_FULL_RES);
    }

    #[test]
    fn test_configure_tap() {
        let mut sim = SimulatedFirmware::new(&INFO);
        let settings = TapSettings {
            int2: true,
            inverted: true,
            tap_thresh: 5000.,
            tap_dur: 0.01,
        };
        Adxl345.configure_tap(&mut sim, &settings).unwrap();
        assert_eq!(sim.register(REG_INT_MAP), INT_MAP_INT2);
        assert_eq!(sim.register(REG_DATA_FORMAT), DATA_FORMAT_INVERTED);
        // 5000 / 612.9 -> 8
        assert_eq!(sim.register(REG_THRESH_TAP), 8);
        assert!((15..=16).contains(&sim.register(REG_DUR)));
    }

    #[test]
    fn test_offsets_are_twos_complement() {
        let mut sim = SimulatedFirmware::new(&INFO);
        Adxl345.write_offsets(&mut sim, [-1, 2, -64]).unwrap();
        assert_eq!(sim.register(REG_OFSX), 0xFF);
        assert_eq!(sim.register(REG_OFSY), 0x02);
        assert_eq!(sim.register(REG_OFSZ), 0xC0);
    }
}
