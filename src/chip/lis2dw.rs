// LIS2DW register map
//
// High-performance 14-bit mode, left-justified in 16-bit words, +-16g.

use super::{set_reg, AccelChip, ChipInfo};
use crate::config::FREEFALL_ACCEL;
use crate::error::Result;
use crate::link::RegisterBus;

pub const REG_WHO_AM_I: u8 = 0x0F;
pub const REG_CTRL1: u8 = 0x20;
pub const REG_CTRL6: u8 = 0x25;
pub const REG_FIFO_CTRL: u8 = 0x2E;

pub const DEV_ID: u8 = 0x44;

// ODR/2 bandwidth, +-16g, low-pass path, low-noise
const CTRL6_SETUP: u8 = 0x34;
// Continuous FIFO mode: the newest sample overwrites the oldest when full
const FIFO_CONTINUOUS: u8 = 0xC0;
const FIFO_BYPASS: u8 = 0x00;

// 1.952mg/LSB at 14 bits, read as 16-bit words
const SCALE: f64 = FREEFALL_ACCEL * 1.952 / 4. / 1000.;

// CTRL1: ODR in bits 7..4, high-performance mode in bits 3..2
const QUERY_RATES: [(u32, u8); 7] = [
    (25, 0x34),
    (50, 0x44),
    (100, 0x54),
    (200, 0x64),
    (400, 0x74),
    (800, 0x84),
    (1600, 0x94),
];

pub static INFO: ChipInfo = ChipInfo {
    name: "lis2dw",
    id_reg: REG_WHO_AM_I,
    dev_id: DEV_ID,
    scale: SCALE,
    sample_bits: 16,
    rates: &QUERY_RATES,
    default_rate: 1600,
    debug_regs: 0x0F..=0x3F,
    tap: None,
};

pub struct Lis2dw;

impl AccelChip for Lis2dw {
    fn info(&self) -> &'static ChipInfo {
        &INFO
    }

    fn configure_rate(&self, bus: &mut dyn RegisterBus, rate: u32, min_clock: u64) -> Result<()> {
        let code = INFO.rate_code(rate).unwrap_or(0x94);
        set_reg(bus, &INFO, REG_CTRL6, CTRL6_SETUP, min_clock)?;
        set_reg(bus, &INFO, REG_FIFO_CTRL, FIFO_CONTINUOUS, 0)?;
        set_reg(bus, &INFO, REG_CTRL1, code, 0)
    }

    fn finish(&self, bus: &mut dyn RegisterBus) -> Result<()> {
        set_reg(bus, &INFO, REG_FIFO_CTRL, FIFO_BYPASS, 0)
    }
}
