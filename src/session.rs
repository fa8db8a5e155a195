// Measurement session: one bounded start/stop acquisition
//
// Idle --start--> Measuring --finish--> Idle
//
// Firmware pushes land in a BlockSink guarded by a mutex, so a link may
// deliver them from any thread while the session is being started or
// finished elsewhere.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::axes::AxisMap;
use crate::chip::{AccelChip, ChipInfo, TapProbe};
use crate::clock::ClockAnchors;
use crate::config::{MAX_BUFFERED_BLOCKS, MIN_MSG_TIME};
use crate::decode::{decode_interval, RawBlock, Sample};
use crate::error::{AccelError, Result};
use crate::link::{ClockBridge, PushHandler, RegisterBus, SensorLink, StatusReport};
use crate::sequence::{drop_count, expected_samples, SequenceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Measuring,
}

#[derive(Debug)]
struct BlockBuffer {
    blocks: Vec<RawBlock>,
    sequence: SequenceState,
    capacity: usize,
    accepting: bool,
    /// Samples accepted into the buffer this session (drained or not)
    received_samples: u64,
    discarded_blocks: u64,
    /// Length of the most recently received block
    last_block_len: usize,
    start_clocks: Option<(u32, u32)>,
}

/// What the buffer held when a session ended
#[derive(Debug)]
struct BufferSnapshot {
    blocks: Vec<RawBlock>,
    sequence: SequenceState,
    received_samples: u64,
    discarded_blocks: u64,
    last_block_len: usize,
    start_clocks: Option<(u32, u32)>,
}

/// Shared raw-block buffer; the link's push handler
#[derive(Debug)]
pub struct BlockSink {
    inner: Mutex<BlockBuffer>,
}

impl BlockSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BlockBuffer {
                blocks: Vec::new(),
                sequence: SequenceState::new(),
                capacity,
                accepting: false,
                received_samples: 0,
                discarded_blocks: 0,
                last_block_len: 0,
                start_clocks: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlockBuffer> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reset(&self, accepting: bool) {
        let mut buffer = self.lock();
        buffer.blocks = Vec::new();
        buffer.sequence.reset();
        buffer.accepting = accepting;
        buffer.received_samples = 0;
        buffer.discarded_blocks = 0;
        buffer.last_block_len = 0;
        buffer.start_clocks = None;
    }

    fn take(&self) -> BufferSnapshot {
        let mut buffer = self.lock();
        buffer.accepting = false;
        BufferSnapshot {
            blocks: std::mem::take(&mut buffer.blocks),
            sequence: buffer.sequence,
            received_samples: buffer.received_samples,
            discarded_blocks: buffer.discarded_blocks,
            last_block_len: buffer.last_block_len,
            start_clocks: buffer.start_clocks,
        }
    }

    /// Remove and return all buffered blocks
    pub fn drain(&self) -> Vec<RawBlock> {
        std::mem::take(&mut self.lock().blocks)
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_sequence(&self) -> u64 {
        self.lock().sequence.last_count()
    }

    pub fn discarded_blocks(&self) -> u64 {
        self.lock().discarded_blocks
    }
}

impl PushHandler for BlockSink {
    fn on_data_block(&self, sequence: u16, payload: &[u8]) {
        let mut buffer = self.lock();
        if !buffer.accepting {
            return;
        }
        let sequence = buffer.sequence.observe(sequence);
        buffer.last_block_len = payload.len();
        if buffer.blocks.len() >= buffer.capacity {
            // Bounded memory: the loss shows up in the drop count
            buffer.discarded_blocks += 1;
            return;
        }
        buffer.received_samples += (payload.len() / crate::config::BYTES_PER_SAMPLE) as u64;
        buffer.blocks.push(RawBlock {
            sequence,
            data: payload.to_vec(),
        });
    }

    fn on_start(&self, start1_clock: u32, start2_clock: u32) {
        let mut buffer = self.lock();
        if buffer.accepting {
            buffer.start_clocks = Some((start1_clock, start2_clock));
        }
    }
}

/// Result of one session, timestamped in interval mode
#[derive(Debug, Clone)]
pub struct AccelResults {
    blocks: Vec<RawBlock>,
    axes: AxisMap,
    sample_bits: u32,
    anchors: ClockAnchors,
    pub drops: u64,
    pub overflows: u64,
    pub total_count: u64,
    pub time_per_sample: f64,
    pub start_range: f64,
    pub end_range: f64,
}

impl AccelResults {
    pub fn empty(axes: AxisMap, sample_bits: u32) -> Self {
        Self {
            blocks: Vec::new(),
            axes,
            sample_bits,
            anchors: ClockAnchors::default(),
            drops: 0,
            overflows: 0,
            total_count: 0,
            time_per_sample: 0.,
            start_range: 0.,
            end_range: 0.,
        }
    }

    pub fn stats(&self) -> String {
        format!(
            "drops={},overflows={},time_per_sample={:.9},start_range={:.6},end_range={:.6}",
            self.drops, self.overflows, self.time_per_sample, self.start_range, self.end_range
        )
    }

    /// Raw blocks still held (not consumed by a batch pipeline)
    pub fn raw_blocks(&self) -> &[RawBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Deferred decode with uniform spacing between the session anchors
    pub fn decode_samples(&self) -> Vec<Sample> {
        match self.anchors.timing(self.total_count) {
            Some(timing) => decode_interval(&self.blocks, &self.axes, self.sample_bits, timing),
            None => Vec::new(),
        }
    }
}

/// Owner of one sensor's acquisition lifecycle
pub struct MeasurementSession {
    chip: Box<dyn AccelChip>,
    link: Box<dyn SensorLink>,
    axes: AxisMap,
    oid: u8,
    default_rate: u32,
    state: SessionState,
    rate: u32,
    sink: Arc<BlockSink>,
    anchors: ClockAnchors,
    start_clock: u64,
    /// Firmware clock of the last start/stop, for ordering register writes
    last_tx_clock: u64,
    /// Results of a session whose chip teardown failed
    unclaimed: Option<AccelResults>,
}

impl MeasurementSession {
    pub fn new(
        chip: Box<dyn AccelChip>,
        link: Box<dyn SensorLink>,
        axes: AxisMap,
        oid: u8,
        default_rate: u32,
    ) -> Self {
        Self::with_capacity(chip, link, axes, oid, default_rate, MAX_BUFFERED_BLOCKS)
    }

    /// Same as `new` with a custom raw-block cap
    pub fn with_capacity(
        chip: Box<dyn AccelChip>,
        mut link: Box<dyn SensorLink>,
        axes: AxisMap,
        oid: u8,
        default_rate: u32,
        capacity: usize,
    ) -> Self {
        let sink = Arc::new(BlockSink::new(capacity));
        link.attach(sink.clone());
        Self {
            chip,
            link,
            axes,
            oid,
            default_rate,
            state: SessionState::Idle,
            rate: default_rate,
            sink,
            anchors: ClockAnchors::default(),
            start_clock: 0,
            last_tx_clock: 0,
            unclaimed: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_measuring(&self) -> bool {
        self.state == SessionState::Measuring
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn default_rate(&self) -> u32 {
        self.default_rate
    }

    pub fn axes(&self) -> &AxisMap {
        &self.axes
    }

    pub fn oid(&self) -> u8 {
        self.oid
    }

    pub fn chip_info(&self) -> &'static ChipInfo {
        self.chip.info()
    }

    pub fn sink(&self) -> &Arc<BlockSink> {
        &self.sink
    }

    pub fn clock(&self) -> &dyn ClockBridge {
        self.link.as_clock()
    }

    pub fn clock_mut(&mut self) -> &mut dyn ClockBridge {
        self.link.as_clock_mut()
    }

    /// Begin streaming; returns the firmware clock of the first sample
    ///
    /// Calling it while already measuring returns the running session's start.
    pub fn start(&mut self, rate: Option<u32>) -> Result<u64> {
        if self.is_measuring() {
            return Ok(self.start_clock);
        }
        let info = self.chip.info();
        let rate = rate.unwrap_or(self.default_rate);
        if !info.rate_supported(rate) {
            return Err(AccelError::Configuration(format!(
                "Not a valid {} query rate: {}",
                info.name, rate
            )));
        }

        self.chip.identify(self.link.as_bus())?;
        self.chip
            .configure_rate(self.link.as_bus(), rate, self.last_tx_clock)?;

        let start_time = self.link.host_now() + MIN_MSG_TIME;
        let start_clock = self.link.host_time_to_ticks(start_time);
        let rest_ticks = self.link.seconds_to_ticks(4. / rate as f64) as u32;
        self.anchors = ClockAnchors {
            start1: start_time,
            start2: start_time,
            ..ClockAnchors::default()
        };
        self.unclaimed = None;
        self.sink.reset(true);
        if let Err(e) = self.link.send_start(self.oid, start_clock, rest_ticks) {
            self.sink.reset(false);
            return Err(e.into());
        }

        self.state = SessionState::Measuring;
        self.rate = rate;
        self.start_clock = start_clock;
        self.last_tx_clock = start_clock;
        info!("{} starting measurements at {} Hz", info.name, rate);
        Ok(start_clock)
    }

    /// Stop streaming and collect the session
    ///
    /// Finishing an idle session yields an empty result. If the chip cannot be
    /// reset afterwards the error is returned and the collected data stays
    /// available through `take_unclaimed`.
    pub fn finish(&mut self) -> Result<AccelResults> {
        let info = self.chip.info();
        if !self.is_measuring() {
            return Ok(AccelResults::empty(self.axes, info.sample_bits));
        }
        self.state = SessionState::Idle;
        let end = self.link.send_stop(self.oid);
        // Blocks pushed before the stop reply are already in the sink
        let snapshot = self.sink.take();
        let end = end?;

        let mut anchors = self.anchors;
        if let Some((start1, start2)) = snapshot.start_clocks {
            anchors.start1 = self.clock_to_time(start1);
            anchors.start2 = self.clock_to_time(start2);
        }
        anchors.end1 = self.clock_to_time(end.end1_clock);
        anchors.end2 = self.clock_to_time(end.end2_clock);
        self.last_tx_clock = self.link.host_time_to_ticks(anchors.end2);

        let end_sequence = snapshot.sequence.convert(end.sequence);
        let total_count = expected_samples(end_sequence, snapshot.last_block_len);
        let time_per_sample = anchors
            .timing(total_count)
            .map(|t| t.time_per_sample)
            .unwrap_or(0.);
        let results = AccelResults {
            blocks: snapshot.blocks,
            axes: self.axes,
            sample_bits: info.sample_bits,
            anchors,
            drops: drop_count(total_count, snapshot.received_samples),
            overflows: end.limit_count as u64,
            total_count,
            time_per_sample,
            start_range: anchors.start_range(),
            end_range: anchors.end_range(),
        };
        if snapshot.discarded_blocks > 0 {
            debug!(
                "{} discarded {} blocks over the buffer cap",
                info.name, snapshot.discarded_blocks
            );
        }

        if let Err(e) = self.chip.finish(self.link.as_bus()) {
            warn!("{} teardown failed after {} samples", info.name, results.total_count);
            self.unclaimed = Some(results);
            return Err(e);
        }
        info!(
            "{} finished {} measurements: {}",
            info.name,
            results.total_count,
            results.stats()
        );
        Ok(results)
    }

    /// Results left behind by a `finish` that failed in chip teardown
    pub fn take_unclaimed(&mut self) -> Option<AccelResults> {
        self.unclaimed.take()
    }

    fn clock_to_time(&mut self, clock: u32) -> f64 {
        let clock = self.link.extend_tick_counter(clock);
        self.link.ticks_to_host_time(clock as f64)
    }

    /// Live status from the firmware (only meaningful while measuring)
    pub fn query_status(&mut self) -> Result<StatusReport> {
        Ok(self.link.send_status_query(self.oid)?)
    }

    /// Deliver pushes the link received outside a request
    pub fn poll_pushes(&mut self) -> Result<()> {
        Ok(self.link.poll_pushes()?)
    }

    /// Hand buffered blocks to a consumer
    pub fn drain_blocks(&self) -> Vec<RawBlock> {
        self.sink.drain()
    }

    pub fn buffered_blocks(&self) -> usize {
        self.sink.len()
    }

    pub fn read_register(&mut self, reg: u8) -> Result<u8> {
        self.chip.read_register(self.link.as_bus(), reg)
    }

    /// Verified write
    pub fn write_register(&mut self, reg: u8, value: u8) -> Result<()> {
        self.chip.write_register(self.link.as_bus(), reg, value, 0)
    }

    /// Run `op` against the chip's tap-probe capability
    pub fn with_tap_probe<R>(
        &mut self,
        op: impl FnOnce(&dyn TapProbe, &mut dyn RegisterBus, &ChipInfo) -> Result<R>,
    ) -> Result<R> {
        let info = self.chip.info();
        let Some(probe) = self.chip.tap_probe() else {
            return Err(AccelError::Configuration(format!(
                "{} does not support probing",
                info.name
            )));
        };
        op(probe, self.link.as_bus(), info)
    }

    /// Firmware clock for a register write `delay` seconds from now
    pub fn clock_after(&self, delay: f64) -> u64 {
        self.link
            .host_time_to_ticks(self.link.host_now() + delay)
            .max(self.last_tx_clock)
    }
}
