// High-level accelerometer driver
//
// Ties one sensor's session, batch pipeline and (optional) tap probe
// together behind the operations exposed to consumers: named measurements
// with CSV export, single-sample queries, debug register access,
// calibration and streaming.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationReport, CalibrationSettings};
use crate::chip::ChipInfo;
use crate::config::{is_valid_name, SensorConfig, QUERY_POLL_INTERVAL};
use crate::decode::Sample;
use crate::error::{AccelError, Result};
use crate::export::{export_path, spawn_export};
use crate::link::serial::SerialLink;
use crate::link::sim::{AutoAdvance, SimulatedFirmware};
use crate::link::SensorLink;
use crate::messages::{AccelBatch, SensorHealth};
use crate::pipeline::{BatchClient, BatchPipeline, SampleCollector};
use crate::probe::TapProbeState;
use crate::session::{AccelResults, MeasurementSession};

/// Result of toggling a named measurement
#[derive(Debug)]
pub enum MeasureOutcome {
    Started { name: String, rate: u32 },
    Stopped {
        name: String,
        path: PathBuf,
        stats: String,
    },
}

pub struct Accelerometer {
    config: SensorConfig,
    session: MeasurementSession,
    pipeline: BatchPipeline,
    probe: Option<TapProbeState>,
    /// Name of the running interval-mode measurement
    measurement: Option<String>,
}

impl Accelerometer {
    /// Connect to the firmware over the configured serial port
    pub fn open(config: SensorConfig) -> Result<Self> {
        info!("Opening {} link on {}", config.chip.info().name, config.port);
        let link = SerialLink::open(
            &config.port,
            config.baudrate,
            config.oid,
            config.mcu_frequency,
        )?;
        Self::with_link(config, Box::new(link))
    }

    /// Drive an in-process simulated chip that follows the wall clock
    pub fn simulated(config: SensorConfig) -> Result<(Self, SimulatedFirmware)> {
        let sim = SimulatedFirmware::new(config.chip.info());
        sim.set_auto_advance(AutoAdvance::WallClock);
        let accel = Self::with_link(config, Box::new(sim.clone()))?;
        Ok((accel, sim))
    }

    pub fn with_link(config: SensorConfig, link: Box<dyn SensorLink>) -> Result<Self> {
        config.validate()?;
        let axes = config.parsed_axes_map()?;
        let probe = match &config.probe {
            Some(probe) => Some(TapProbeState::new(
                CalibrationSettings::from_config(probe)?,
                probe.z_offset,
            )),
            None => None,
        };
        let session =
            MeasurementSession::new(config.chip.build(), link, axes, config.oid, config.rate());
        Ok(Self {
            config,
            session,
            pipeline: BatchPipeline::new(),
            probe,
            measurement: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn chip_info(&self) -> &'static ChipInfo {
        self.session.chip_info()
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn is_measuring(&self) -> bool {
        self.session.is_measuring()
    }

    pub fn is_streaming(&self) -> bool {
        self.pipeline.is_active()
    }

    pub fn health(&self) -> SensorHealth {
        if self.pipeline.is_active() {
            SensorHealth::Streaming
        } else if self.session.is_measuring() {
            SensorHealth::Measuring
        } else {
            SensorHealth::Idle
        }
    }

    fn ensure_idle(&self, what: &str) -> Result<()> {
        if self.session.is_measuring() {
            return Err(AccelError::Configuration(format!(
                "{}: {} is busy measuring",
                what,
                self.chip_info().name
            )));
        }
        Ok(())
    }

    /// Start a named measurement, or stop the running one and export it
    ///
    /// A name given when stopping overrides the one given at start.
    pub fn measure(&mut self, name: Option<&str>, rate: Option<u32>) -> Result<MeasureOutcome> {
        if let Some(name) = name {
            if !is_valid_name(name) {
                return Err(AccelError::Configuration(
                    "Invalid measurement name (alphanumerics, '-' and '_' only)".to_string(),
                ));
            }
        }
        if let Some(started) = self.measurement.take() {
            let name = name.map(str::to_string).unwrap_or(started);
            let results = match self.session.finish() {
                Ok(results) => results,
                Err(e) => {
                    if let Some(results) = self.session.take_unclaimed() {
                        let path = self.export(&name, results);
                        warn!("Stop failed, exporting collected data to {}", path.display());
                    }
                    return Err(e);
                }
            };
            let stats = results.stats();
            let path = self.export(&name, results);
            return Ok(MeasureOutcome::Stopped { name, path, stats });
        }
        if self.pipeline.is_active() {
            return Err(AccelError::Configuration(
                "Cannot start a measurement while streaming".to_string(),
            ));
        }
        let name = name.map(str::to_string).unwrap_or_else(default_measurement_name);
        self.session.start(rate)?;
        self.measurement = Some(name.clone());
        Ok(MeasureOutcome::Started {
            name,
            rate: self.session.rate(),
        })
    }

    /// Write `results` in the background; returns the target path
    pub fn export(&self, name: &str, results: AccelResults) -> PathBuf {
        let path = export_path(
            &self.config.export_dir,
            self.chip_info().name,
            &self.config.name,
            name,
        );
        spawn_export(path.clone(), results);
        path
    }

    /// Measure until the first samples arrive and return the latest one
    ///
    /// Gives up after `query_timeout` seconds; the session is stopped either way.
    pub async fn query(&mut self) -> Result<Sample> {
        if self.measurement.is_some() {
            return Err(AccelError::Configuration(
                "Cannot query while a measurement is running".to_string(),
            ));
        }
        let collector = SampleCollector::new();
        self.pipeline
            .add_client(&mut self.session, Box::new(collector.clone()))?;
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.query_timeout);
        let mut tick = interval(QUERY_POLL_INTERVAL);
        let outcome = loop {
            tick.tick().await;
            if let Err(e) = self.pipeline.step(&mut self.session) {
                break Err(e);
            }
            if let Some(sample) = collector.latest() {
                break Ok(sample);
            }
            if Instant::now() >= deadline {
                break Err(AccelError::Timeout(self.chip_info().name.to_string()));
            }
        };
        collector.finish();
        // A failed step already ended the session
        if self.pipeline.client_count() <= 1 {
            if let Err(e) = self.pipeline.stop(&mut self.session) {
                warn!("Failed to stop query: {}", e);
            }
        }
        outcome
    }

    pub fn debug_read(&mut self, reg: u8) -> Result<u8> {
        self.check_debug_reg(reg)?;
        let value = self.session.read_register(reg)?;
        debug!("{} debug read {:#x} = {:#x}", self.chip_info().name, reg, value);
        Ok(value)
    }

    pub fn debug_write(&mut self, reg: u8, value: u8) -> Result<()> {
        self.check_debug_reg(reg)?;
        self.session.write_register(reg, value)
    }

    fn check_debug_reg(&self, reg: u8) -> Result<()> {
        self.ensure_idle("Debug access")?;
        let info = self.chip_info();
        if !info.debug_regs.contains(&reg) {
            return Err(AccelError::Configuration(format!(
                "Invalid {} register {:#x} (allowed {:#x}..={:#x})",
                info.name,
                reg,
                info.debug_regs.start(),
                info.debug_regs.end()
            )));
        }
        Ok(())
    }

    pub fn probe(&self) -> Option<&TapProbeState> {
        self.probe.as_ref()
    }

    /// Force probe [re-]calibration
    pub async fn calibrate(&mut self) -> Result<CalibrationReport> {
        self.ensure_idle("Calibration")?;
        let Some(probe) = self.probe.as_mut() else {
            return Err(no_probe(&self.config.name));
        };
        probe.calibrate(&mut self.session).await.cloned()
    }

    pub fn probe_prepare(&mut self) -> Result<()> {
        let Some(probe) = self.probe.as_ref() else {
            return Err(no_probe(&self.config.name));
        };
        probe.prepare(&mut self.session)
    }

    pub fn probe_finish(&mut self) -> Result<()> {
        let Some(probe) = self.probe.as_ref() else {
            return Err(no_probe(&self.config.name));
        };
        probe.finish(&mut self.session)
    }

    pub fn set_probe(&mut self, tap_thresh: Option<f64>, tap_dur: Option<f64>) -> Result<()> {
        let Some(probe) = self.probe.as_mut() else {
            return Err(no_probe(&self.config.name));
        };
        probe.set_tap_params(&mut self.session, tap_thresh, tap_dur)
    }

    /// Stream batches through a channel; the stream stops when the receiver is dropped
    pub fn subscribe(&mut self) -> Result<UnboundedReceiver<AccelBatch>> {
        let (tx, rx) = unbounded_channel();
        self.add_client(Box::new(tx))?;
        Ok(rx)
    }

    pub fn add_client(&mut self, client: Box<dyn BatchClient>) -> Result<()> {
        if self.measurement.is_some() {
            return Err(AccelError::Configuration(
                "Cannot stream while a measurement is running".to_string(),
            ));
        }
        self.pipeline.add_client(&mut self.session, client)
    }

    /// Drop every streaming client (after a final batch)
    pub fn stop_streaming(&mut self) -> Result<()> {
        self.pipeline.stop(&mut self.session)?;
        Ok(())
    }

    /// One batch-pipeline tick; returns whether streaming continues
    pub fn step_batch(&mut self) -> Result<bool> {
        self.pipeline.step(&mut self.session)
    }
}

impl Drop for Accelerometer {
    fn drop(&mut self) {
        // Leave the firmware quiet
        if self.session.is_measuring() {
            if let Err(e) = self.session.finish() {
                warn!("Failed to stop measurements on drop: {}", e);
            }
        }
    }
}

fn no_probe(sensor: &str) -> AccelError {
    AccelError::Configuration(format!("{} has no probe configured", sensor))
}

/// Unix-seconds fallback name for unnamed measurements
fn default_measurement_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{adxl345, ChipKind};

    fn accel(sim: &SimulatedFirmware) -> Accelerometer {
        let mut config = SensorConfig::new(ChipKind::Adxl345);
        config.rate = Some(1600);
        Accelerometer::with_link(config, Box::new(sim.clone())).unwrap()
    }

    #[test]
    fn test_debug_access_range_and_busy() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut accel = accel(&sim);
        accel.debug_write(0x1E, 0x12).unwrap();
        assert_eq!(accel.debug_read(0x1E).unwrap(), 0x12);
        assert!(matches!(
            accel.debug_read(0x00),
            Err(AccelError::Configuration(_))
        ));
        accel.measure(Some("busy"), None).unwrap();
        assert!(matches!(
            accel.debug_read(0x1E),
            Err(AccelError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_name_overrides_start_name() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut config = SensorConfig::new(ChipKind::Adxl345);
        config.export_dir = std::env::temp_dir();
        let mut accel = Accelerometer::with_link(config, Box::new(sim.clone())).unwrap();
        accel.measure(Some("first"), None).unwrap();
        sim.advance_samples(8);
        match accel.measure(Some("second"), None).unwrap() {
            MeasureOutcome::Stopped { name, path, .. } => {
                assert_eq!(name, "second");
                assert!(path.ends_with("adxl345-second.csv"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        accel.measure(Some("kept"), None).unwrap();
        match accel.measure(None, None).unwrap() {
            MeasureOutcome::Stopped { name, .. } => assert_eq!(name, "kept"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_on_dead_link_leaves_session_idle() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut accel = accel(&sim);
        sim.set_offline(true);
        assert!(accel.query().await.is_err());
        sim.set_offline(false);
        sim.set_auto_advance(AutoAdvance::PerRequest(16));
        // Start failed, so nothing to clean up; a later stream works
        let _rx = accel.subscribe().unwrap();
        assert!(accel.step_batch().unwrap());
        sim.set_offline(true);
        assert!(accel.step_batch().is_err());
        assert!(!accel.is_measuring());
        assert!(!accel.is_streaming());
        assert_eq!(accel.health(), SensorHealth::Idle);
    }

    #[test]
    fn test_measure_rejects_bad_name() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut accel = accel(&sim);
        assert!(accel.measure(Some("a b"), None).is_err());
        assert_eq!(sim.starts(), 0);
    }

    #[test]
    fn test_probe_requires_configuration() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut accel = accel(&sim);
        assert!(matches!(
            accel.probe_prepare(),
            Err(AccelError::Configuration(_))
        ));
    }

    #[test]
    fn test_health_follows_session() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut accel = accel(&sim);
        assert_eq!(accel.health(), SensorHealth::Idle);
        accel.measure(Some("run"), None).unwrap();
        assert_eq!(accel.health(), SensorHealth::Measuring);
        assert!(accel.subscribe().is_err());
    }
}
