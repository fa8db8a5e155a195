// Tap probe: calibration gate plus arm/disarm around a probing move

use tracing::{debug, info};

use crate::calibration::{self, CalibrationReport, CalibrationSettings};
use crate::error::{AccelError, Result};
use crate::session::MeasurementSession;

/// Chip settle time before/after a probing move (seconds)
pub const REST_TIME: f64 = 0.01;

/// Contact probe built on a tap-capable accelerometer
#[derive(Debug)]
pub struct TapProbeState {
    settings: CalibrationSettings,
    calibrated: bool,
    z_offset: f64,
    last_report: Option<CalibrationReport>,
}

impl TapProbeState {
    pub fn new(settings: CalibrationSettings, z_offset: f64) -> Self {
        Self {
            settings,
            calibrated: false,
            z_offset,
            last_report: None,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn z_offset(&self) -> f64 {
        self.z_offset
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    pub fn last_report(&self) -> Option<&CalibrationReport> {
        self.last_report.as_ref()
    }

    /// Force [re-]calibration; an aborted run leaves the probe unusable
    pub async fn calibrate(&mut self, session: &mut MeasurementSession) -> Result<&CalibrationReport> {
        self.calibrated = false;
        let report = calibration::calibrate(session, &self.settings).await?;
        self.calibrated = report.is_calibrated();
        Ok(self.last_report.insert(report))
    }

    /// Arm the tap interrupt before a probing move
    pub fn prepare(&self, session: &mut MeasurementSession) -> Result<()> {
        if !self.calibrated {
            let name = session.chip_info().name;
            return Err(AccelError::Configuration(format!(
                "{} probe failed calibration, retry with ACCEL_PROBE_CALIBRATE command",
                name
            )));
        }
        let measuring = session.is_measuring();
        let clock = session.clock_after(REST_TIME);
        session.with_tap_probe(|probe, bus, info| {
            probe.arm(bus, measuring, clock)?;
            if probe.tap_latched(bus)? {
                return Err(AccelError::Configuration(format!(
                    "{} tap triggered before move, too sensitive?",
                    info.name
                )));
            }
            Ok(())
        })?;
        debug!("Tap probe armed at clock {}", clock);
        Ok(())
    }

    /// Disarm after the move
    pub fn finish(&self, session: &mut MeasurementSession) -> Result<()> {
        let measuring = session.is_measuring();
        let clock = session.clock_after(REST_TIME);
        session.with_tap_probe(|probe, bus, info| {
            probe.disarm(bus, measuring, clock)?;
            if probe.tap_latched(bus)? {
                return Err(AccelError::Configuration(format!(
                    "{} tap triggered after move, too sensitive?",
                    info.name
                )));
            }
            Ok(())
        })
    }

    /// Update tap threshold (mm/s^2) and/or duration (s) at runtime
    pub fn set_tap_params(
        &mut self,
        session: &mut MeasurementSession,
        tap_thresh: Option<f64>,
        tap_dur: Option<f64>,
    ) -> Result<()> {
        let thresh = tap_thresh.unwrap_or(self.settings.tap.tap_thresh);
        let dur = tap_dur.unwrap_or(self.settings.tap.tap_dur);
        session.with_tap_probe(|probe, bus, info| {
            if let Some(tap) = &info.tap {
                tap.check_thresh(thresh)?;
                tap.check_dur(dur)?;
            }
            probe.set_tap_params(bus, thresh, dur)
        })?;
        self.settings.tap.tap_thresh = thresh;
        self.settings.tap.tap_dur = dur;
        info!("Tap probe set to tap_thresh={} tap_dur={}", thresh, dur);
        Ok(())
    }
}
