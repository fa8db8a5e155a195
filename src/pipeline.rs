// Batch pipeline: periodic regression-mode decoding for streaming clients
//
// Every BATCH_INTERVAL the pipeline queries the firmware status (feeding the
// clock regression), drains the session's raw blocks, decodes them and hands
// one AccelBatch to each client. The first client starts the session, the
// last one leaving stops it. A link failure ends the session and drops every
// client.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::clock::{ChipClockUpdater, ClockSyncRegression};
use crate::config::{BATCH_INTERVAL, SAMPLES_PER_BLOCK};
use crate::decode::{decode_regression, RawBlock, Sample};
use crate::error::Result;
use crate::messages::AccelBatch;
use crate::session::{AccelResults, MeasurementSession};

/// Lower bound of the status-query duration filter
const MIN_QUERY_WINDOW_SECS: f64 = 0.000_005;

/// Receiver of decoded batches; returning false unsubscribes
pub trait BatchClient: Send {
    fn handle_batch(&mut self, batch: &AccelBatch) -> bool;
}

impl BatchClient for UnboundedSender<AccelBatch> {
    fn handle_batch(&mut self, batch: &AccelBatch) -> bool {
        // Fails only once the receiver is gone
        self.send(batch.clone()).is_ok()
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    batches: Vec<AccelBatch>,
    finished: bool,
}

/// Accumulates batches until told to finish
///
/// Clones share the same buffer, so one handle can be given to the pipeline
/// while another reads the result.
#[derive(Debug, Clone, Default)]
pub struct SampleCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl SampleCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop accepting batches; the pipeline drops the collector on its next batch
    pub fn finish(&self) {
        self.state().finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    pub fn has_data(&self) -> bool {
        self.state().batches.iter().any(|b| !b.is_empty())
    }

    pub fn latest(&self) -> Option<Sample> {
        self.state()
            .batches
            .iter()
            .rev()
            .find_map(|b| b.data.last().copied())
    }

    /// Running (errors, overflows) as of the latest batch
    pub fn error_counts(&self) -> (u64, u64) {
        self.state()
            .batches
            .last()
            .map(|b| (b.errors, b.overflows))
            .unwrap_or((0, 0))
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.state()
            .batches
            .iter()
            .flat_map(|b| b.data.iter().copied())
            .collect()
    }

    /// Samples with `start <= time <= end`
    pub fn samples_between(&self, start: f64, end: f64) -> Vec<Sample> {
        self.samples()
            .into_iter()
            .filter(|s| s.time >= start && s.time <= end)
            .collect()
    }
}

impl BatchClient for SampleCollector {
    fn handle_batch(&mut self, batch: &AccelBatch) -> bool {
        let mut state = self.state();
        if state.finished {
            return false;
        }
        state.batches.push(batch.clone());
        true
    }
}

/// Streaming front end of a MeasurementSession
pub struct BatchPipeline {
    clients: Vec<Box<dyn BatchClient>>,
    sync: ClockSyncRegression,
    updater: ChipClockUpdater,
    /// Next block sequence expected by the gap counter
    next_sequence: u64,
    /// Samples missing from the stream since the session started
    errors: u64,
    /// Whether the running session was started by this pipeline
    owns_session: bool,
}

impl Default for BatchPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchPipeline {
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
            sync: ClockSyncRegression::new(1., 1.),
            updater: ChipClockUpdater::new(1),
            next_sequence: 0,
            errors: 0,
            owns_session: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.clients.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Subscribe a client, starting the session for the first one
    pub fn add_client(
        &mut self,
        session: &mut MeasurementSession,
        client: Box<dyn BatchClient>,
    ) -> Result<()> {
        if self.clients.is_empty() {
            self.start(session)?;
        }
        self.clients.push(client);
        Ok(())
    }

    fn start(&mut self, session: &mut MeasurementSession) -> Result<()> {
        self.owns_session = !session.is_measuring();
        let start_clock = session.start(None)?;
        let rate = session.rate();
        let freq = session.clock().frequency();
        self.sync.set_rate(
            ClockSyncRegression::smoothing_for(rate, BATCH_INTERVAL.as_secs_f64()),
            freq / rate as f64,
        );
        let window = session.clock().seconds_to_ticks(MIN_QUERY_WINDOW_SECS).max(1);
        self.updater = ChipClockUpdater::new(window);
        self.updater.note_start(&mut self.sync, start_clock);
        self.next_sequence = 0;
        self.errors = 0;
        // Blocks already buffered belong to the interval-mode owner
        if self.owns_session {
            let report = session.query_status()?;
            self.updater
                .update_clock(&mut self.sync, session.clock_mut(), &report);
        }
        info!("Batch pipeline started at {} Hz", rate);
        Ok(())
    }

    /// Decode everything pending; None when there is nothing to publish
    pub fn process_batch(&mut self, session: &mut MeasurementSession) -> Result<Option<AccelBatch>> {
        if !session.is_measuring() {
            return Ok(None);
        }
        session.poll_pushes()?;
        let report = session.query_status()?;
        self.updater
            .update_clock(&mut self.sync, session.clock_mut(), &report);

        let blocks = session.drain_blocks();
        Ok(self.decode_blocks(session, &blocks))
    }

    fn decode_blocks(
        &mut self,
        session: &MeasurementSession,
        blocks: &[RawBlock],
    ) -> Option<AccelBatch> {
        if blocks.is_empty() {
            return None;
        }
        let per_block = SAMPLES_PER_BLOCK as u64;
        for block in blocks {
            if block.sequence >= self.next_sequence {
                self.errors += (block.sequence - self.next_sequence) * per_block;
                self.next_sequence = block.sequence + 1;
            } else {
                // Late block, already counted as missing
                self.errors = self.errors.saturating_sub(per_block);
            }
        }

        let translation = self.sync.time_translation(session.clock());
        let (data, last_tick) = decode_regression(
            blocks,
            session.axes(),
            session.chip_info().sample_bits,
            translation,
        );
        if let Some(tick) = last_tick {
            self.sync.set_last_chip_clock(tick as f64);
        }
        Some(AccelBatch {
            data,
            errors: self.errors,
            overflows: self.updater.last_limit_count(),
        })
    }

    /// Hand a batch to every client, dropping those that unsubscribe
    pub fn dispatch(&mut self, session: &mut MeasurementSession, batch: &AccelBatch) -> Result<()> {
        let before = self.clients.len();
        self.clients.retain_mut(|client| client.handle_batch(batch));
        if self.clients.len() < before {
            debug!("{} batch clients left", self.clients.len());
        }
        if before > 0 && self.clients.is_empty() {
            self.finish_session(session)?;
        }
        Ok(())
    }

    /// One pipeline tick; returns whether any client is still subscribed
    ///
    /// On error the session has been stopped and every client dropped.
    pub fn step(&mut self, session: &mut MeasurementSession) -> Result<bool> {
        if self.clients.is_empty() {
            return Ok(false);
        }
        if !session.is_measuring() {
            warn!("Session stopped under the batch pipeline, dropping clients");
            self.clients.clear();
            self.owns_session = false;
            return Ok(false);
        }
        let outcome = match self.process_batch(session) {
            Ok(Some(batch)) => self.dispatch(session, &batch),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.abort(session);
            return Err(e);
        }
        Ok(self.is_active())
    }

    /// Final batches to the remaining clients, then unsubscribe everyone
    ///
    /// Samples flushed by the firmware's stop reach the clients too. The
    /// session ends even when the link fails.
    pub fn stop(&mut self, session: &mut MeasurementSession) -> Result<Option<AccelResults>> {
        if self.clients.is_empty() {
            return Ok(None);
        }
        match self.flush_and_finish(session) {
            Ok(results) => {
                self.clients.clear();
                Ok(results)
            }
            Err(e) => {
                self.abort(session);
                Err(e)
            }
        }
    }

    fn flush_and_finish(&mut self, session: &mut MeasurementSession) -> Result<Option<AccelResults>> {
        if let Some(batch) = self.process_batch(session)? {
            self.broadcast(&batch);
        }
        let Some(results) = self.finish_session(session)? else {
            return Ok(None);
        };
        if let Some(batch) = self.decode_blocks(session, results.raw_blocks()) {
            self.broadcast(&batch);
        }
        Ok(Some(results))
    }

    fn broadcast(&mut self, batch: &AccelBatch) {
        for client in &mut self.clients {
            client.handle_batch(batch);
        }
    }

    /// Drop every client and force the session down
    fn abort(&mut self, session: &mut MeasurementSession) {
        warn!("Batch pipeline aborted, dropping {} clients", self.clients.len());
        self.clients.clear();
        self.owns_session = false;
        if session.is_measuring() {
            if let Err(e) = session.finish() {
                warn!("Failed to stop measurements: {}", e);
            }
        }
    }

    fn finish_session(&mut self, session: &mut MeasurementSession) -> Result<Option<AccelResults>> {
        if !std::mem::take(&mut self.owns_session) {
            return Ok(None);
        }
        info!("Batch pipeline stopped");
        session.finish().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::AxisMap;
    use crate::chip::{adxl345, ChipKind};
    use crate::decode::encode_raw;
    use crate::link::sim::{AutoAdvance, SimulatedFirmware};
    use crate::link::PushHandler;

    fn session(sim: &SimulatedFirmware) -> MeasurementSession {
        let info = &adxl345::INFO;
        MeasurementSession::new(
            ChipKind::Adxl345.build(),
            Box::new(sim.clone()),
            AxisMap::identity(info.scale),
            0,
            1600,
        )
    }

    #[test]
    fn test_idle_pipeline_publishes_nothing() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        assert!(pipeline.process_batch(&mut session).unwrap().is_none());
        assert!(!pipeline.step(&mut session).unwrap());
        assert_eq!(sim.starts(), 0);
    }

    #[test]
    fn test_no_publish_without_blocks() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let collector = SampleCollector::new();
        pipeline
            .add_client(&mut session, Box::new(collector.clone()))
            .unwrap();
        assert!(pipeline.process_batch(&mut session).unwrap().is_none());
        assert!(!collector.has_data());
    }

    #[test]
    fn test_batches_are_monotonic() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        sim.set_auto_advance(AutoAdvance::PerRequest(160));
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let collector = SampleCollector::new();
        pipeline
            .add_client(&mut session, Box::new(collector.clone()))
            .unwrap();
        for _ in 0..5 {
            assert!(pipeline.step(&mut session).unwrap());
        }
        let samples = collector.samples();
        assert!(samples.len() >= 160 * 4);
        assert!(samples.windows(2).all(|w| w[1].time > w[0].time));
        assert_eq!(collector.error_counts(), (0, 0));
        let z = samples.last().unwrap().z;
        assert!((z - crate::config::FREEFALL_ACCEL).abs() < 40.);
    }

    #[test]
    fn test_last_client_stops_session() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        sim.set_auto_advance(AutoAdvance::PerRequest(16));
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let collector = SampleCollector::new();
        pipeline
            .add_client(&mut session, Box::new(collector.clone()))
            .unwrap();
        assert!(pipeline.step(&mut session).unwrap());
        collector.finish();
        assert!(!pipeline.step(&mut session).unwrap());
        assert!(!session.is_measuring());
        assert!(!sim.is_streaming());
    }

    #[test]
    fn test_dropped_channel_unsubscribes() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        sim.set_auto_advance(AutoAdvance::PerRequest(16));
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        pipeline.add_client(&mut session, Box::new(tx)).unwrap();
        drop(rx);
        assert!(!pipeline.step(&mut session).unwrap());
        assert!(!session.is_measuring());
    }

    #[test]
    fn test_link_failure_ends_session() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        sim.set_auto_advance(AutoAdvance::PerRequest(16));
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let collector = SampleCollector::new();
        pipeline
            .add_client(&mut session, Box::new(collector.clone()))
            .unwrap();
        assert!(pipeline.step(&mut session).unwrap());

        sim.set_offline(true);
        assert!(pipeline.step(&mut session).unwrap_err().is_connectivity());
        assert!(!session.is_measuring());
        assert!(!pipeline.is_active());
        assert!(pipeline.stop(&mut session).unwrap().is_none());

        // Recovers once the link is back
        sim.set_offline(false);
        pipeline
            .add_client(&mut session, Box::new(SampleCollector::new()))
            .unwrap();
        assert!(session.is_measuring());
        assert_eq!(sim.starts(), 2);
    }

    #[test]
    fn test_stop_on_dead_link_still_ends_session() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        pipeline
            .add_client(&mut session, Box::new(SampleCollector::new()))
            .unwrap();
        sim.set_offline(true);
        assert!(pipeline.stop(&mut session).is_err());
        assert!(!session.is_measuring());
        assert_eq!(pipeline.client_count(), 0);
    }

    #[test]
    fn test_stop_delivers_partial_block() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let collector = SampleCollector::new();
        pipeline
            .add_client(&mut session, Box::new(collector.clone()))
            .unwrap();
        sim.advance_samples(12);
        let results = pipeline.stop(&mut session).unwrap().unwrap();
        assert_eq!(results.total_count, 12);
        let samples = collector.samples();
        assert_eq!(samples.len(), 12);
        assert!(samples.windows(2).all(|w| w[1].time > w[0].time));
        assert!(!sim.is_streaming());
    }

    #[test]
    fn test_late_block_timestamped_in_place() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let collector = SampleCollector::new();
        pipeline
            .add_client(&mut session, Box::new(collector.clone()))
            .unwrap();
        let payload = encode_raw([0, 0, 256]).repeat(SAMPLES_PER_BLOCK);
        for seq in [0u16, 1, 3, 2, 4] {
            session.sink().on_data_block(seq, &payload);
        }
        assert!(pipeline.step(&mut session).unwrap());

        let samples = collector.samples();
        assert_eq!(samples.len(), 40);
        // Received order: blocks 0, 1, 3, 2, 4
        assert!(samples[24].time > samples[15].time);
        assert!(samples[31].time < samples[16].time);
        let span = samples[39].time - samples[0].time;
        assert!(span > 0. && span < 0.1, "span {}", span);
        assert_eq!(collector.error_counts().0, 0);
    }

    #[test]
    fn test_errors_are_running_totals() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        sim.drop_block(1);
        sim.set_auto_advance(AutoAdvance::PerRequest(32));
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        pipeline.add_client(&mut session, Box::new(tx)).unwrap();
        for _ in 0..3 {
            assert!(pipeline.step(&mut session).unwrap());
        }
        let mut errors = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            errors.push(batch.errors);
        }
        assert_eq!(errors, vec![8, 8, 8]);
    }

    #[test]
    fn test_gap_reported_as_errors() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        sim.drop_block(1);
        sim.set_auto_advance(AutoAdvance::PerRequest(32));
        let mut session = session(&sim);
        let mut pipeline = BatchPipeline::new();
        let collector = SampleCollector::new();
        pipeline
            .add_client(&mut session, Box::new(collector.clone()))
            .unwrap();
        pipeline.step(&mut session).unwrap();
        pipeline.step(&mut session).unwrap();
        assert_eq!(collector.error_counts().0, 8);
    }
}
