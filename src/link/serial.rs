// Serial transport to the motion-control firmware
//
// Packet format: [0xFF, 0xFF, OID, Length, Kind, Params..., Checksum]
// Replies carry a status byte after Kind. Unsolicited pushes (data blocks,
// start anchors) may arrive between any request and its reply and are handed
// to the attached PushHandler as they are read.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    le_u16, le_u32, ClockBridge, EndReport, FirmwareChannel, LinkError, McuClock, PushHandler,
    RegisterBus, Result, StatusReport,
};

pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Host -> firmware instructions (replies echo the instruction)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    ReadReg = 0x01,
    WriteReg = 0x02,
    QueryStart = 0x10,
    QueryEnd = 0x11,
    QueryStatus = 0x12,
}

/// Firmware -> host unsolicited packet kinds
const PUSH_DATA: u8 = 0x80;
const PUSH_START: u8 = 0x81;

/// One decoded packet from the firmware
#[derive(Debug)]
struct Packet {
    oid: u8,
    kind: u8,
    params: Vec<u8>,
}

/// Serial link handling register access and bulk queries for one sensor
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    oid: u8,
    clock: McuClock,
    handler: Option<Arc<dyn PushHandler>>,
}

impl SerialLink {
    /// Open the link to the firmware that owns sensor `oid`
    pub fn open(port_name: &str, baudrate: u32, oid: u8, mcu_frequency: f64) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        let mut link = Self {
            port,
            oid,
            clock: McuClock::new(mcu_frequency),
            handler: None,
        };
        // Anchor the host estimate of the firmware clock
        link.send_status_query(oid)?;
        Ok(link)
    }

    /// Calculate checksum for a packet (excluding header)
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(oid: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + instruction + checksum
        let mut packet = Vec::with_capacity(6 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(oid);
        packet.push(length);
        packet.push(instruction as u8);
        packet.extend_from_slice(params);

        let checksum_data = &packet[2..]; // skip header
        packet.push(Self::checksum(checksum_data));

        packet
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read one packet of any kind
    fn read_packet(&mut self) -> Result<Packet> {
        let oid = self.oid;
        let mut header = [0u8; 2];
        self.port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                LinkError::Timeout { oid }
            } else {
                LinkError::Io(e)
            }
        })?;

        if header != HEADER {
            return Err(LinkError::InvalidResponse {
                oid,
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut oid_length = [0u8; 2];
        self.port.read_exact(&mut oid_length)?;
        let packet_oid = oid_length[0];
        let length = oid_length[1] as usize;
        if length < 3 {
            return Err(LinkError::InvalidResponse {
                oid,
                reason: format!("Packet too short: {}", length),
            });
        }

        // kind + status + params + checksum
        let mut remaining = vec![0u8; length];
        self.port.read_exact(&mut remaining)?;

        let mut checksum_data = vec![packet_oid, length as u8];
        checksum_data.extend_from_slice(&remaining[..remaining.len() - 1]);
        if Self::checksum(&checksum_data) != remaining[remaining.len() - 1] {
            return Err(LinkError::ChecksumMismatch { oid: packet_oid });
        }

        let status = remaining[1];
        if status != 0 {
            return Err(LinkError::FirmwareError {
                oid: packet_oid,
                status,
            });
        }

        Ok(Packet {
            oid: packet_oid,
            kind: remaining[0],
            params: remaining[2..remaining.len() - 1].to_vec(),
        })
    }

    /// Forward an unsolicited packet; returns false if it is a reply
    fn dispatch_push(&self, packet: &Packet) -> bool {
        match packet.kind {
            PUSH_DATA if packet.params.len() >= 2 => {
                if let Some(handler) = &self.handler {
                    handler.on_data_block(le_u16(&packet.params[..2]), &packet.params[2..]);
                }
                true
            }
            PUSH_START if packet.params.len() >= 8 => {
                if let Some(handler) = &self.handler {
                    handler.on_start(le_u32(&packet.params[..4]), le_u32(&packet.params[4..8]));
                }
                true
            }
            PUSH_DATA | PUSH_START => {
                warn!("Dropping truncated push packet {:#x}", packet.kind);
                true
            }
            _ => false,
        }
    }

    /// Send a request and wait for its reply, delivering pushes on the way
    fn request(&mut self, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
        let packet = Self::build_packet(self.oid, instruction, params);
        self.send_packet(&packet)?;

        loop {
            let reply = self.read_packet()?;
            if self.dispatch_push(&reply) {
                continue;
            }
            if reply.oid != self.oid || reply.kind != instruction as u8 {
                return Err(LinkError::InvalidResponse {
                    oid: self.oid,
                    reason: format!(
                        "Unexpected reply: oid {} kind {:#x} (wanted {:?})",
                        reply.oid, reply.kind, instruction
                    ),
                });
            }
            return Ok(reply.params);
        }
    }
}

impl RegisterBus for SerialLink {
    fn read_register(&mut self, reg: u8) -> Result<u8> {
        let response = self.request(Instruction::ReadReg, &[reg])?;
        response.first().copied().ok_or(LinkError::InvalidResponse {
            oid: self.oid,
            reason: "Empty response".to_string(),
        })
    }

    fn write_register(&mut self, reg: u8, value: u8, min_clock: u64) -> Result<()> {
        debug!("Write reg={:#x}, value={:#x}, min_clock={}", reg, value, min_clock);
        let mut params = vec![reg, value];
        params.extend_from_slice(&(min_clock as u32).to_le_bytes());
        self.request(Instruction::WriteReg, &params)?;
        Ok(())
    }
}

impl FirmwareChannel for SerialLink {
    fn attach(&mut self, handler: Arc<dyn PushHandler>) {
        self.handler = Some(handler);
    }

    fn send_start(&mut self, oid: u8, start_clock: u64, rest_ticks: u32) -> Result<()> {
        self.oid = oid;
        let mut params = Vec::with_capacity(8);
        params.extend_from_slice(&(start_clock as u32).to_le_bytes());
        params.extend_from_slice(&rest_ticks.to_le_bytes());
        self.request(Instruction::QueryStart, &params)?;
        Ok(())
    }

    fn send_stop(&mut self, oid: u8) -> Result<EndReport> {
        self.oid = oid;
        let params = self.request(Instruction::QueryEnd, &[0; 8])?;
        EndReport::from_params(oid, &params)
    }

    fn send_status_query(&mut self, oid: u8) -> Result<StatusReport> {
        self.oid = oid;
        let sent_at = self.clock.host_now();
        let params = self.request(Instruction::QueryStatus, &[])?;
        let report = StatusReport::from_params(oid, &params)?;
        // Keep the host estimate of the firmware clock fresh
        let clock = self.clock.extend_tick_counter(report.clock);
        let received_at = self.clock.host_now();
        self.clock.sync(clock, (sent_at + received_at) / 2.);
        Ok(report)
    }

    fn poll_pushes(&mut self) -> Result<()> {
        while self.port.bytes_to_read()? > 0 {
            let packet = self.read_packet()?;
            if !self.dispatch_push(&packet) {
                warn!("Discarding stray reply kind {:#x}", packet.kind);
            }
        }
        Ok(())
    }
}

impl ClockBridge for SerialLink {
    fn frequency(&self) -> f64 {
        self.clock.frequency()
    }

    fn host_now(&self) -> f64 {
        self.clock.host_now()
    }

    fn host_time_to_ticks(&self, time: f64) -> u64 {
        self.clock.host_time_to_ticks(time)
    }

    fn ticks_to_host_time(&self, ticks: f64) -> f64 {
        self.clock.ticks_to_host_time(ticks)
    }

    fn extend_tick_counter(&mut self, narrow: u32) -> u64 {
        self.clock.extend_tick_counter(narrow)
    }
}
