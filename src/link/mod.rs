// Collaborator contracts for the firmware link
//
// Provides:
// - RegisterBus: raw register access on the sensor bus
// - FirmwareChannel: bulk-query commands plus unsolicited pushes
// - ClockBridge: host time <-> firmware clock ticks
// - SerialLink (serial transport) and SimulatedFirmware (in-process firmware)

use std::sync::Arc;
use std::time::Instant;

use crate::sequence::extend_u32_signed;

pub mod serial;
pub mod sim;

pub use serial::SerialLink;
pub use sim::SimulatedFirmware;

/// Error types for firmware link communication
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response for oid {oid}: {reason}")]
    InvalidResponse { oid: u8, reason: String },

    #[error("Checksum mismatch for oid {oid}")]
    ChecksumMismatch { oid: u8 },

    #[error("Firmware returned error status for oid {oid}: 0x{status:02X}")]
    FirmwareError { oid: u8, status: u8 },

    #[error("Timeout waiting for response for oid {oid}")]
    Timeout { oid: u8 },
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// Periodic status reply of a streaming sensor
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatusReport {
    /// Firmware clock (low 32 bits) when the chip FIFO was queried
    pub clock: u32,
    /// Ticks the query took
    pub query_ticks: u32,
    /// Next block sequence number (low 16 bits)
    pub next_sequence: u16,
    /// Bytes waiting in the firmware's partial block
    pub buffered: u8,
    /// Samples waiting in the chip FIFO
    pub fifo: u8,
    /// Times the chip FIFO overflowed (low 16 bits)
    pub limit_count: u16,
}

/// Reply to the stop command
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EndReport {
    pub end1_clock: u32,
    pub end2_clock: u32,
    pub limit_count: u16,
    /// Next (unsent) block sequence number (low 16 bits)
    pub sequence: u16,
}

impl StatusReport {
    pub const WIRE_LEN: usize = 14;

    pub fn from_params(oid: u8, params: &[u8]) -> Result<Self> {
        check_len(oid, params, Self::WIRE_LEN)?;
        Ok(Self {
            clock: le_u32(&params[0..4]),
            query_ticks: le_u32(&params[4..8]),
            next_sequence: le_u16(&params[8..10]),
            buffered: params[10],
            fifo: params[11],
            limit_count: le_u16(&params[12..14]),
        })
    }

    pub fn to_params(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.extend_from_slice(&self.clock.to_le_bytes());
        out.extend_from_slice(&self.query_ticks.to_le_bytes());
        out.extend_from_slice(&self.next_sequence.to_le_bytes());
        out.push(self.buffered);
        out.push(self.fifo);
        out.extend_from_slice(&self.limit_count.to_le_bytes());
        out
    }
}

impl EndReport {
    pub const WIRE_LEN: usize = 12;

    pub fn from_params(oid: u8, params: &[u8]) -> Result<Self> {
        check_len(oid, params, Self::WIRE_LEN)?;
        Ok(Self {
            end1_clock: le_u32(&params[0..4]),
            end2_clock: le_u32(&params[4..8]),
            limit_count: le_u16(&params[8..10]),
            sequence: le_u16(&params[10..12]),
        })
    }
}

fn check_len(oid: u8, params: &[u8], len: usize) -> Result<()> {
    if params.len() < len {
        return Err(LinkError::InvalidResponse {
            oid,
            reason: format!("Expected {} bytes, got {}", len, params.len()),
        });
    }
    Ok(())
}

pub(crate) fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

pub(crate) fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Receiver of unsolicited firmware pushes; may be called from any thread
pub trait PushHandler: Send + Sync {
    fn on_data_block(&self, sequence: u16, payload: &[u8]);

    /// Start anchors: clock before and after the first chip query
    fn on_start(&self, start1_clock: u32, start2_clock: u32);
}

/// Register access on the sensor bus
pub trait RegisterBus {
    fn read_register(&mut self, reg: u8) -> Result<u8>;

    /// Write a register no earlier than `min_clock` (0 = as soon as possible)
    fn write_register(&mut self, reg: u8, value: u8, min_clock: u64) -> Result<()>;
}

/// Bulk-query command channel of the firmware
pub trait FirmwareChannel {
    /// Register the receiver of unsolicited pushes
    fn attach(&mut self, handler: Arc<dyn PushHandler>);

    fn send_start(&mut self, oid: u8, start_clock: u64, rest_ticks: u32) -> Result<()>;

    /// Stop streaming; pushes sent before the reply are delivered first
    fn send_stop(&mut self, oid: u8) -> Result<EndReport>;

    fn send_status_query(&mut self, oid: u8) -> Result<StatusReport>;

    /// Deliver any pushes that arrived outside a request
    fn poll_pushes(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Host time (seconds) <-> firmware clock mapping
pub trait ClockBridge {
    fn frequency(&self) -> f64;

    fn host_now(&self) -> f64;

    fn host_time_to_ticks(&self, time: f64) -> u64;

    fn ticks_to_host_time(&self, ticks: f64) -> f64;

    /// Widen a 32-bit firmware clock to 64 bits
    fn extend_tick_counter(&mut self, narrow: u32) -> u64;

    fn seconds_to_ticks(&self, seconds: f64) -> u64 {
        (seconds * self.frequency()).max(0.) as u64
    }
}

/// Everything a measurement session needs from the link
pub trait SensorLink: RegisterBus + FirmwareChannel + ClockBridge + Send {
    fn as_bus(&mut self) -> &mut dyn RegisterBus;

    fn as_clock(&self) -> &dyn ClockBridge;

    fn as_clock_mut(&mut self) -> &mut dyn ClockBridge;
}

impl<T: RegisterBus + FirmwareChannel + ClockBridge + Send> SensorLink for T {
    fn as_bus(&mut self) -> &mut dyn RegisterBus {
        self
    }

    fn as_clock(&self) -> &dyn ClockBridge {
        self
    }

    fn as_clock_mut(&mut self) -> &mut dyn ClockBridge {
        self
    }
}

/// Linear firmware clock estimate anchored to a host monotonic clock
#[derive(Debug, Clone)]
pub struct McuClock {
    frequency: f64,
    origin: Instant,
    /// Firmware ticks at host time zero
    tick_offset: f64,
    last_clock: u64,
    synced: bool,
}

impl McuClock {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            origin: Instant::now(),
            tick_offset: 0.,
            last_clock: 0,
            synced: false,
        }
    }

    /// Re-anchor from a firmware clock observed at `host_time`
    pub fn sync(&mut self, clock: u64, host_time: f64) {
        self.tick_offset = clock as f64 - host_time * self.frequency;
        self.synced = true;
    }
}

impl ClockBridge for McuClock {
    fn frequency(&self) -> f64 {
        self.frequency
    }

    fn host_now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn host_time_to_ticks(&self, time: f64) -> u64 {
        (time * self.frequency + self.tick_offset).max(0.) as u64
    }

    fn ticks_to_host_time(&self, ticks: f64) -> f64 {
        (ticks - self.tick_offset) / self.frequency
    }

    fn extend_tick_counter(&mut self, narrow: u32) -> u64 {
        let clock = if self.synced {
            let estimate = self.host_time_to_ticks(self.host_now());
            extend_u32_signed(self.last_clock.max(estimate), narrow)
        } else {
            // Nothing to extend against before the first sync
            narrow as u64
        };
        self.last_clock = self.last_clock.max(clock);
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_report_wire() {
        let report = StatusReport {
            clock: 0xDEAD_BEEF,
            query_ticks: 120,
            next_sequence: 0xFFFE,
            buffered: 18,
            fifo: 3,
            limit_count: 2,
        };
        let params = report.to_params();
        assert_eq!(params.len(), StatusReport::WIRE_LEN);
        assert_eq!(StatusReport::from_params(1, &params).unwrap(), report);
        assert!(StatusReport::from_params(1, &params[..5]).is_err());
    }

    #[test]
    fn test_end_report_parse() {
        let params = [1, 0, 0, 0, 2, 0, 0, 0, 5, 0, 0x34, 0x12];
        let end = EndReport::from_params(0, &params).unwrap();
        assert_eq!(end.end1_clock, 1);
        assert_eq!(end.end2_clock, 2);
        assert_eq!(end.limit_count, 5);
        assert_eq!(end.sequence, 0x1234);
    }

    #[test]
    fn test_mcu_clock_mapping() {
        let mut clock = McuClock::new(1_000_000.);
        clock.sync(5_000_000, 2.0);
        assert_eq!(clock.host_time_to_ticks(3.0), 6_000_000);
        assert!((clock.ticks_to_host_time(7_000_000.) - 4.0).abs() < 1e-9);
        assert_eq!(clock.seconds_to_ticks(0.5), 500_000);
        assert_eq!(clock.extend_tick_counter(0x7000_0000), 0x7000_0000);
        assert_eq!(clock.extend_tick_counter(0xE000_0000), 0xE000_0000);
        assert_eq!(clock.extend_tick_counter(0x10), 0x1_0000_0010);
        // Slightly stale readings map just below the last value
        assert_eq!(clock.extend_tick_counter(0x08), 0x1_0000_0008);
    }
}
