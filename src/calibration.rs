// Probe self-calibration
//
// Measures the chip at rest for a settling interval, checks that it sees
// gravity and little noise, then writes per-axis offset registers so the
// resting reading becomes zero. Only failed checks are retried; link and
// chip faults abort immediately.

use std::time::Duration;

use tracing::{info, warn};

use crate::chip::{ChipInfo, TapSettings};
use crate::config::{parse_int_pin, ProbeConfig, FREEFALL_ACCEL};
use crate::decode::Sample;
use crate::error::{AccelError, Result};
use crate::session::MeasurementSession;

/// Accepted deviation of the measured gravity magnitude
const FREEFALL_TOLERANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct CalibrationSettings {
    /// Attempts after the first one
    pub retries: u32,
    /// Settling interval measured by each attempt
    pub settle: Duration,
    pub tap: TapSettings,
}

impl CalibrationSettings {
    pub fn from_config(probe: &ProbeConfig) -> Result<Self> {
        let (int2, inverted) = parse_int_pin(&probe.int_pin)?;
        Ok(Self {
            retries: probe.calibration_retries,
            settle: Duration::from_secs_f64(probe.calibration_time.max(0.)),
            tap: TapSettings {
                int2,
                inverted,
                tap_thresh: probe.tap_thresh,
                tap_dur: probe.tap_dur,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Calibrated {
        /// Offset register values in raw axis order
        offsets: [i8; 3],
        /// Per-axis mean before calibration (mm/s^2)
        mean: [f64; 3],
        noise: f64,
    },
    Aborted {
        reason: String,
    },
}

/// What a calibration run did, including every retry message
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub outcome: CalibrationOutcome,
    pub attempts: u32,
    pub messages: Vec<String>,
}

impl CalibrationReport {
    pub fn is_calibrated(&self) -> bool {
        matches!(self.outcome, CalibrationOutcome::Calibrated { .. })
    }

    /// Turn an aborted run into an error for callers that need the probe
    pub fn require_calibrated(self) -> Result<[i8; 3]> {
        match self.outcome {
            CalibrationOutcome::Calibrated { offsets, .. } => Ok(offsets),
            CalibrationOutcome::Aborted { reason } => Err(AccelError::Calibration(reason)),
        }
    }
}

/// Run calibration with up to `retries + 1` attempts
pub async fn calibrate(
    session: &mut MeasurementSession,
    settings: &CalibrationSettings,
) -> Result<CalibrationReport> {
    let name = session.chip_info().name;
    let mut messages = Vec::new();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let samples = measure_at_rest(session, settings).await?;
        let error = match check_samples(&samples, settings.tap.tap_thresh) {
            Ok((mean, noise)) => {
                let offsets = offsets_for(session, mean)?;
                session.with_tap_probe(|probe, bus, _| probe.write_offsets(bus, offsets))?;
                let msg = format!("Successfully calibrated {}", name);
                info!("{} (offsets {:?})", msg, offsets);
                messages.push(msg);
                return Ok(CalibrationReport {
                    outcome: CalibrationOutcome::Calibrated {
                        offsets,
                        mean,
                        noise,
                    },
                    attempts: attempt,
                    messages,
                });
            }
            Err(error) => error,
        };
        let remaining = settings.retries + 1 - attempt;
        if remaining > 0 {
            let msg = format!("Calibration error: {} {}, retrying ({})", name, error, remaining - 1);
            info!("{}", msg);
            messages.push(msg);
            continue;
        }
        let msg = format!("Calibration error: {} {}, aborting self-calibration", name, error);
        warn!("{}", msg);
        messages.push(msg.clone());
        return Ok(CalibrationReport {
            outcome: CalibrationOutcome::Aborted { reason: msg },
            attempts: attempt,
            messages,
        });
    }
}

/// One settling measurement with tap detection configured and offsets zeroed
async fn measure_at_rest(
    session: &mut MeasurementSession,
    settings: &CalibrationSettings,
) -> Result<Vec<Sample>> {
    session.with_tap_probe(|probe, bus, _| probe.configure_tap(bus, &settings.tap))?;
    session.start(None)?;
    let guard = StopOnDrop { session };
    tokio::time::sleep(settings.settle).await;
    let results = guard.session.finish()?;
    Ok(results.decode_samples())
}

/// Stops a running session if the settle wait is cancelled
struct StopOnDrop<'a> {
    session: &'a mut MeasurementSession,
}

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        if self.session.is_measuring() {
            warn!("Calibration cancelled, stopping measurements");
            if let Err(e) = self.session.finish() {
                warn!("Failed to stop measurements: {}", e);
            }
        }
    }
}

/// Per-axis mean and peak deviation, or why the chip is unusable
fn check_samples(samples: &[Sample], tap_thresh: f64) -> std::result::Result<([f64; 3], f64), String> {
    if samples.is_empty() {
        return Err("returned no samples".to_string());
    }
    let n = samples.len() as f64;
    let mut mean = [0.; 3];
    for s in samples {
        mean[0] += s.x / n;
        mean[1] += s.y / n;
        mean[2] += s.z / n;
    }
    let magnitude = mean.iter().map(|m| m * m).sum::<f64>().sqrt();
    if (magnitude - FREEFALL_ACCEL).abs() > FREEFALL_ACCEL * FREEFALL_TOLERANCE {
        return Err(format!(
            "incorrectly measures freefall accleration: {:.0} (measured) vs {:.0} (expected)",
            magnitude, FREEFALL_ACCEL
        ));
    }
    let noise = samples
        .iter()
        .flat_map(|s| [(s.x - mean[0]).abs(), (s.y - mean[1]).abs(), (s.z - mean[2]).abs()])
        .fold(0., f64::max);
    if noise > tap_thresh {
        return Err(format!(
            "noise level too high for the configured tap_thresh: {:.0} (tap_thresh) vs {:.0} (noise)",
            tap_thresh, noise
        ));
    }
    Ok((mean, noise))
}

/// Offset register values (raw axis order) cancelling `mean`
fn offsets_for(session: &MeasurementSession, mean: [f64; 3]) -> Result<[i8; 3]> {
    let info: &ChipInfo = session.chip_info();
    let Some(tap) = &info.tap else {
        return Err(AccelError::Configuration(format!(
            "{} does not support probing",
            info.name
        )));
    };
    let ratio = info.scale / tap.offset_scale;
    let mut offsets = [0i8; 3];
    for (logical, m) in mean.into_iter().enumerate() {
        let source = session.axes().axis(logical);
        let value = (-m / source.scale * ratio).round();
        offsets[source.index] = value.clamp(i8::MIN as f64, i8::MAX as f64) as i8;
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(x: f64, y: f64, z: f64) -> Sample {
        Sample { time: 0., x, y, z }
    }

    #[test]
    fn test_check_accepts_gravity() {
        let samples = vec![sample(10., -10., 9800.), sample(-10., 10., 9810.)];
        let (mean, noise) = check_samples(&samples, 5000.).unwrap();
        assert!((mean[2] - 9805.).abs() < 1e-9);
        assert!((noise - 10.).abs() < 1e-9);
    }

    #[test]
    fn test_check_rejects_freefall_and_noise() {
        let err = check_samples(&[sample(0., 0., 100.)], 5000.).unwrap_err();
        assert!(err.contains("freefall"));
        let noisy = vec![sample(6000., 0., 9806.), sample(-6000., 0., 9806.)];
        let err = check_samples(&noisy, 5000.).unwrap_err();
        assert!(err.contains("noise"));
        assert!(check_samples(&[], 5000.).is_err());
    }
}
