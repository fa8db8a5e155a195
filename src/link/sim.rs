// In-process firmware simulation
//
// Emulates the sensor register file and the firmware bulk query: samples are
// produced from a signal function at the rate implied by `rest_ticks`, packed
// into 8-sample blocks and pushed to the attached handler. Time only moves
// when told to (or from the wall clock with AutoAdvance::WallClock), which
// keeps tests deterministic.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::{
    ClockBridge, EndReport, FirmwareChannel, LinkError, PushHandler, RegisterBus, Result,
    StatusReport,
};
use crate::chip::ChipInfo;
use crate::config::{BYTES_PER_SAMPLE, SAMPLES_PER_BLOCK};
use crate::sequence::extend_u32_signed;

pub const SIM_FREQUENCY: f64 = 1_000_000.;

/// Raw (x, y, z) chip counts for sample index `k`
pub type Signal = Box<dyn FnMut(u64) -> [i32; 3] + Send>;

/// When simulated time moves forward on its own
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutoAdvance {
    /// Only through `advance_samples`
    Manual,
    /// Produce this many samples on every status query, stop and poll
    PerRequest(u64),
    /// Follow the host wall clock
    WallClock,
}

struct Stream {
    start_clock: u64,
    ticks_per_sample: f64,
    produced: u64,
    next_sequence: u64,
    pending: Vec<u8>,
    wall_start: Instant,
}

struct SimState {
    info: &'static ChipInfo,
    registers: [u8; 256],
    stuck: HashSet<u8>,
    offline: bool,
    now: u64,
    last_clock: u64,
    handler: Option<Arc<dyn PushHandler>>,
    stream: Option<Stream>,
    signal: Signal,
    auto: AutoAdvance,
    dropped: HashSet<u64>,
    limit_count: u16,
    starts: usize,
}

enum Push {
    Data(u16, Vec<u8>),
    Start(u32, u32),
}

/// Simulated firmware plus sensor; clones share the same state
#[derive(Clone)]
pub struct SimulatedFirmware {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedFirmware {
    /// A healthy chip at rest with gravity on +z
    pub fn new(info: &'static ChipInfo) -> Self {
        let one_g = (crate::config::FREEFALL_ACCEL / info.scale).round() as i32;
        let mut registers = [0u8; 256];
        registers[info.id_reg as usize] = info.dev_id;
        Self {
            state: Arc::new(Mutex::new(SimState {
                info,
                registers,
                stuck: HashSet::new(),
                offline: false,
                now: 0,
                last_clock: 0,
                handler: None,
                stream: None,
                signal: Box::new(move |_| [0, 0, one_g]),
                auto: AutoAdvance::Manual,
                dropped: HashSet::new(),
                limit_count: 0,
                starts: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_signal(&self, signal: Signal) {
        self.state().signal = signal;
    }

    pub fn set_auto_advance(&self, auto: AutoAdvance) {
        self.state().auto = auto;
    }

    /// Make writes to `reg` silently fail (e.g. a broken wire)
    pub fn set_stuck_register(&self, reg: u8) {
        self.state().stuck.insert(reg);
    }

    /// Make every register access time out
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn set_register(&self, reg: u8, value: u8) {
        self.state().registers[reg as usize] = value;
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.state().registers[reg as usize]
    }

    /// Produce blocks with this (extended) sequence but never deliver them
    pub fn drop_block(&self, sequence: u64) {
        self.state().dropped.insert(sequence);
    }

    pub fn set_limit_count(&self, count: u16) {
        self.state().limit_count = count;
    }

    pub fn is_streaming(&self) -> bool {
        self.state().stream.is_some()
    }

    /// Number of bulk queries started so far
    pub fn starts(&self) -> usize {
        self.state().starts
    }

    /// Produce `count` samples if streaming
    pub fn advance_samples(&self, count: u64) {
        let pushes = self.state().produce(count);
        self.deliver(pushes);
    }

    fn deliver(&self, pushes: Vec<Push>) {
        let Some(handler) = self.state().handler.clone() else {
            return;
        };
        for push in pushes {
            match push {
                Push::Data(sequence, payload) => handler.on_data_block(sequence, &payload),
                Push::Start(start1, start2) => handler.on_start(start1, start2),
            }
        }
    }

    fn auto_advance(&self) {
        let pushes = {
            let mut state = self.state();
            match state.auto {
                AutoAdvance::Manual => Vec::new(),
                AutoAdvance::PerRequest(count) => state.produce(count),
                AutoAdvance::WallClock => {
                    let due = state
                        .stream
                        .as_ref()
                        .map(|s| {
                            let secs = s.wall_start.elapsed().as_secs_f64();
                            let total = (secs * SIM_FREQUENCY / s.ticks_per_sample) as u64;
                            total.saturating_sub(s.produced)
                        })
                        .unwrap_or(0);
                    state.produce(due)
                }
            }
        };
        self.deliver(pushes);
    }
}

impl SimState {
    fn produce(&mut self, count: u64) -> Vec<Push> {
        let mut pushes = Vec::new();
        let Some(stream) = self.stream.as_mut() else {
            return pushes;
        };
        for _ in 0..count {
            let raw = (self.signal)(stream.produced);
            for value in raw {
                let word = value.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                stream.pending.extend_from_slice(&word.to_le_bytes());
            }
            stream.produced += 1;
            if stream.pending.len() == SAMPLES_PER_BLOCK * BYTES_PER_SAMPLE {
                let payload = std::mem::take(&mut stream.pending);
                if !self.dropped.contains(&stream.next_sequence) {
                    pushes.push(Push::Data(stream.next_sequence as u16, payload));
                }
                stream.next_sequence += 1;
            }
        }
        self.now = stream.start_clock + (stream.produced as f64 * stream.ticks_per_sample) as u64;
        pushes
    }

    fn check_online(&self) -> Result<()> {
        if self.offline {
            return Err(LinkError::Timeout { oid: 0 });
        }
        Ok(())
    }
}

impl RegisterBus for SimulatedFirmware {
    fn read_register(&mut self, reg: u8) -> Result<u8> {
        let state = self.state();
        state.check_online()?;
        Ok(state.registers[reg as usize])
    }

    fn write_register(&mut self, reg: u8, value: u8, _min_clock: u64) -> Result<()> {
        let mut state = self.state();
        state.check_online()?;
        if !state.stuck.contains(&reg) {
            state.registers[reg as usize] = value;
        }
        Ok(())
    }
}

impl FirmwareChannel for SimulatedFirmware {
    fn attach(&mut self, handler: Arc<dyn PushHandler>) {
        self.state().handler = Some(handler);
    }

    fn send_start(&mut self, _oid: u8, start_clock: u64, rest_ticks: u32) -> Result<()> {
        let push = {
            let mut state = self.state();
            state.check_online()?;
            state.starts += 1;
            // rest_ticks covers four samples
            let ticks_per_sample = (rest_ticks.max(1) as f64) / 4.;
            state.now = state.now.max(start_clock);
            let start2 = state.now;
            state.stream = Some(Stream {
                start_clock: start2,
                ticks_per_sample,
                produced: 0,
                next_sequence: 0,
                pending: Vec::new(),
                wall_start: Instant::now(),
            });
            let start1 = start2.saturating_sub(ticks_per_sample as u64 / 2);
            Push::Start(start1 as u32, start2 as u32)
        };
        self.deliver(vec![push]);
        Ok(())
    }

    fn send_stop(&mut self, _oid: u8) -> Result<EndReport> {
        self.state().check_online()?;
        self.auto_advance();
        let (pushes, report) = {
            let mut state = self.state();
            let limit_count = state.limit_count;
            let now = state.now;
            let Some(mut stream) = state.stream.take() else {
                return Ok(EndReport {
                    end1_clock: now as u32,
                    end2_clock: now as u32,
                    limit_count,
                    sequence: 0,
                });
            };
            let mut pushes = Vec::new();
            if !stream.pending.is_empty() {
                let payload = std::mem::take(&mut stream.pending);
                if !state.dropped.contains(&stream.next_sequence) {
                    pushes.push(Push::Data(stream.next_sequence as u16, payload));
                }
                stream.next_sequence += 1;
            }
            let end2 = now;
            let end1 = end2.saturating_sub(stream.ticks_per_sample as u64 / 2);
            let report = EndReport {
                end1_clock: end1 as u32,
                end2_clock: end2 as u32,
                limit_count,
                sequence: stream.next_sequence as u16,
            };
            (pushes, report)
        };
        self.deliver(pushes);
        Ok(report)
    }

    fn send_status_query(&mut self, _oid: u8) -> Result<StatusReport> {
        self.state().check_online()?;
        self.auto_advance();
        let state = self.state();
        let (next_sequence, buffered) = state
            .stream
            .as_ref()
            .map(|s| (s.next_sequence as u16, s.pending.len() as u8))
            .unwrap_or((0, 0));
        Ok(StatusReport {
            clock: state.now as u32,
            query_ticks: 10,
            next_sequence,
            buffered,
            fifo: 0,
            limit_count: state.limit_count,
        })
    }

    fn poll_pushes(&mut self) -> Result<()> {
        self.state().check_online()?;
        self.auto_advance();
        Ok(())
    }
}

impl ClockBridge for SimulatedFirmware {
    fn frequency(&self) -> f64 {
        SIM_FREQUENCY
    }

    fn host_now(&self) -> f64 {
        self.state().now as f64 / SIM_FREQUENCY
    }

    fn host_time_to_ticks(&self, time: f64) -> u64 {
        (time * SIM_FREQUENCY).max(0.) as u64
    }

    fn ticks_to_host_time(&self, ticks: f64) -> f64 {
        ticks / SIM_FREQUENCY
    }

    fn extend_tick_counter(&mut self, narrow: u32) -> u64 {
        let mut state = self.state();
        let clock = extend_u32_signed(state.last_clock, narrow);
        state.last_clock = state.last_clock.max(clock);
        clock
    }
}

impl std::fmt::Debug for SimulatedFirmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SimulatedFirmware")
            .field("chip", &state.info.name)
            .field("now", &state.now)
            .field("streaming", &state.stream.is_some())
            .finish()
    }
}
