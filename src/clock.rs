//! Chip clock synchronization
//!
//! Two ways of mapping sample indices ("chip ticks") to host time:
//!
//! - [`ClockAnchors`]: interval mode. Uniform spacing between the session's
//!   start and end anchors, only known once the session is over.
//! - [`ClockSyncRegression`]: continuous mode. An exponentially decayed linear
//!   regression of firmware clock against chip ticks, fed by periodic status
//!   queries through [`ChipClockUpdater`], usable while streaming.

use tracing::debug;

use crate::config::{BYTES_PER_SAMPLE, SAMPLES_PER_BLOCK};
use crate::decode::IntervalTiming;
use crate::link::{ClockBridge, StatusReport};
use crate::sequence::extend_u16;

/// Default regression decay factor
pub const DEFAULT_DECAY: f64 = 1. / 20.;

/// Linear chip tick -> host time mapping:
/// `time = time_base + (tick - chip_base) * inv_freq`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeTranslation {
    pub time_base: f64,
    pub chip_base: f64,
    pub inv_freq: f64,
}

impl TimeTranslation {
    pub fn time_of(&self, tick: f64) -> f64 {
        self.time_base + (tick - self.chip_base) * self.inv_freq
    }
}

/// Host-time anchors of one session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockAnchors {
    /// Coarse estimate of the first sample (before the first chip query)
    pub start1: f64,
    /// First sample time
    pub start2: f64,
    /// Coarse estimate of the end
    pub end1: f64,
    /// End of the last sample period
    pub end2: f64,
}

impl ClockAnchors {
    /// Spread `total_count` samples evenly over start2..end2
    pub fn timing(&self, total_count: u64) -> Option<IntervalTiming> {
        if total_count == 0 || self.end2 <= self.start2 {
            return None;
        }
        Some(IntervalTiming {
            start_time: self.start2,
            time_per_sample: (self.end2 - self.start2) / total_count as f64,
        })
    }

    pub fn start_range(&self) -> f64 {
        self.start2 - self.start1
    }

    pub fn end_range(&self) -> f64 {
        self.end2 - self.end1
    }
}

/// Rolling linear fit of firmware clock (ticks) against chip ticks
#[derive(Debug, Clone)]
pub struct ClockSyncRegression {
    chip_clock_smooth: f64,
    decay: f64,
    /// Firmware ticks per chip tick assumed until the fit has data
    nominal_inv_freq: f64,
    last_chip_clock: f64,
    last_exp_mcu_clock: f64,
    mcu_clock_avg: f64,
    mcu_clock_variance: f64,
    chip_clock_avg: f64,
    chip_clock_covariance: f64,
}

impl ClockSyncRegression {
    pub fn new(chip_clock_smooth: f64, nominal_inv_freq: f64) -> Self {
        Self {
            chip_clock_smooth,
            decay: DEFAULT_DECAY,
            nominal_inv_freq,
            last_chip_clock: 0.,
            last_exp_mcu_clock: 0.,
            mcu_clock_avg: 0.,
            mcu_clock_variance: 0.,
            chip_clock_avg: 0.,
            chip_clock_covariance: 0.,
        }
    }

    /// Smoothing window in chip ticks for a rate and batch interval
    pub fn smoothing_for(rate: u32, batch_interval_secs: f64) -> f64 {
        rate as f64 * batch_interval_secs * 2.
    }

    /// Retune after a sample-rate change
    pub fn set_rate(&mut self, chip_clock_smooth: f64, nominal_inv_freq: f64) {
        self.chip_clock_smooth = chip_clock_smooth;
        self.nominal_inv_freq = nominal_inv_freq;
    }

    pub fn reset(&mut self, mcu_clock: f64, chip_clock: f64) {
        self.mcu_clock_avg = mcu_clock;
        self.chip_clock_avg = chip_clock;
        self.mcu_clock_variance = 0.;
        self.chip_clock_covariance = 0.;
        self.last_chip_clock = 0.;
        self.last_exp_mcu_clock = 0.;
    }

    /// Fold in one (firmware clock, chip tick) observation
    pub fn update(&mut self, mcu_clock: f64, chip_clock: f64) {
        let decay = self.decay;
        let diff_mcu_clock = mcu_clock - self.mcu_clock_avg;
        self.mcu_clock_avg += decay * diff_mcu_clock;
        self.mcu_clock_variance =
            (1. - decay) * (self.mcu_clock_variance + diff_mcu_clock * diff_mcu_clock * decay);
        let diff_chip_clock = chip_clock - self.chip_clock_avg;
        self.chip_clock_avg += decay * diff_chip_clock;
        self.chip_clock_covariance = (1. - decay)
            * (self.chip_clock_covariance + diff_mcu_clock * diff_chip_clock * decay);
    }

    /// Record the last chip tick handed out; the base never moves backwards
    pub fn set_last_chip_clock(&mut self, chip_clock: f64) {
        if chip_clock <= self.last_chip_clock {
            return;
        }
        let (base_mcu, base_chip, inv_cfreq) = self.clock_translation();
        self.last_chip_clock = chip_clock;
        self.last_exp_mcu_clock = base_mcu + (chip_clock - base_chip) * inv_cfreq;
    }

    fn fitted_inv_freq(&self) -> f64 {
        if self.chip_clock_covariance <= 0. {
            return self.nominal_inv_freq;
        }
        let inv = self.mcu_clock_variance / self.chip_clock_covariance;
        if inv.is_finite() && inv > 0. {
            inv
        } else {
            self.nominal_inv_freq
        }
    }

    /// (firmware clock base, chip tick base, firmware ticks per chip tick)
    pub fn clock_translation(&self) -> (f64, f64, f64) {
        let inv_chip_freq = self.fitted_inv_freq();
        if self.last_chip_clock == 0. {
            return (self.mcu_clock_avg, self.chip_clock_avg, inv_chip_freq);
        }
        // Aim at the fitted line a smoothing window ahead of the last tick
        let s_chip_clock = self.last_chip_clock + self.chip_clock_smooth;
        let scdiff = s_chip_clock - self.chip_clock_avg;
        let s_mcu_clock = self.mcu_clock_avg + scdiff * inv_chip_freq;
        let mdiff = s_mcu_clock - self.last_exp_mcu_clock;
        let mut s_inv_chip_freq = mdiff / self.chip_clock_smooth;
        if !(s_inv_chip_freq.is_finite() && s_inv_chip_freq > 0.) {
            s_inv_chip_freq = inv_chip_freq;
        }
        (self.last_exp_mcu_clock, self.last_chip_clock, s_inv_chip_freq)
    }

    /// The same translation expressed in host seconds
    pub fn time_translation(&self, bridge: &dyn ClockBridge) -> TimeTranslation {
        let (base_mcu, base_chip, inv_cfreq) = self.clock_translation();
        let time_base = bridge.ticks_to_host_time(base_mcu);
        let inv_freq = bridge.ticks_to_host_time(base_mcu + inv_cfreq) - time_base;
        TimeTranslation {
            time_base,
            chip_base: base_chip,
            inv_freq,
        }
    }
}

/// Feeds status replies into a [`ClockSyncRegression`]
#[derive(Debug, Clone)]
pub struct ChipClockUpdater {
    last_sequence: u64,
    last_limit_count: u64,
    max_query_duration: u64,
    min_query_window: u64,
}

impl ChipClockUpdater {
    /// `min_query_window`: lower bound in firmware ticks for the duration filter
    pub fn new(min_query_window: u64) -> Self {
        Self {
            last_sequence: 0,
            last_limit_count: 0,
            max_query_duration: 1 << 31,
            min_query_window,
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn last_limit_count(&self) -> u64 {
        self.last_limit_count
    }

    pub fn clear_duration_filter(&mut self) {
        self.max_query_duration = 1 << 31;
    }

    pub fn note_start(&mut self, sync: &mut ClockSyncRegression, start_clock: u64) {
        self.last_sequence = 0;
        self.last_limit_count = 0;
        sync.reset(start_clock as f64, 0.);
        self.clear_duration_filter();
    }

    /// Fold a status reply into the regression
    ///
    /// Replies whose query took unusually long are skipped, as they would
    /// skew the fit.
    pub fn update_clock(
        &mut self,
        sync: &mut ClockSyncRegression,
        bridge: &mut dyn ClockBridge,
        report: &StatusReport,
    ) {
        let mcu_clock = bridge.extend_tick_counter(report.clock);
        self.last_sequence = extend_u16(self.last_sequence, report.next_sequence);
        self.last_limit_count = extend_u16(self.last_limit_count, report.limit_count);
        let duration = report.query_ticks as u64;
        if duration > self.max_query_duration {
            self.max_query_duration = (2 * self.max_query_duration).max(self.min_query_window);
            debug!("Skipping slow status query ({} ticks)", duration);
            return;
        }
        self.max_query_duration = 2 * duration;
        let msg_count = self.last_sequence * SAMPLES_PER_BLOCK as u64
            + report.buffered as u64 / BYTES_PER_SAMPLE as u64
            + report.fifo as u64;
        // +0.5 for the average query inaccuracy, +0.5 for chip processing time
        let chip_clock = msg_count + 1;
        sync.update((mcu_clock + duration / 2) as f64, chip_clock as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::McuClock;

    #[test]
    fn test_anchor_timing() {
        let anchors = ClockAnchors {
            start1: 0.9,
            start2: 1.0,
            end1: 1.95,
            end2: 2.0,
        };
        let timing = anchors.timing(100).unwrap();
        assert_eq!(timing.start_time, 1.0);
        assert!((timing.time_per_sample - 0.01).abs() < 1e-12);
        assert!((anchors.start_range() - 0.1).abs() < 1e-12);
        assert!(anchors.timing(0).is_none());
    }

    #[test]
    fn test_regression_learns_frequency() {
        // 1 MHz firmware clock, 1600 Hz chip: 625 ticks per sample
        let mut sync = ClockSyncRegression::new(320., 600.);
        sync.reset(0., 0.);
        for i in 1..200u64 {
            let chip = (i * 160) as f64;
            sync.update(chip * 625., chip);
        }
        let (_, _, inv) = sync.clock_translation();
        assert!((inv - 625.).abs() < 1e-6, "inv {}", inv);
    }

    #[test]
    fn test_degenerate_fit_uses_nominal() {
        let mut sync = ClockSyncRegression::new(320., 625.);
        sync.reset(1000., 0.);
        let (base, chip, inv) = sync.clock_translation();
        assert_eq!((base, chip, inv), (1000., 0., 625.));
        sync.update(1000., 0.);
        assert_eq!(sync.clock_translation().2, 625.);
    }

    #[test]
    fn test_chip_base_never_regresses() {
        let mut sync = ClockSyncRegression::new(320., 625.);
        sync.reset(0., 0.);
        sync.set_last_chip_clock(500.);
        let (mcu_a, base_a, _) = sync.clock_translation();
        sync.set_last_chip_clock(100.);
        let (mcu_b, base_b, _) = sync.clock_translation();
        assert_eq!(base_a, 500.);
        assert_eq!((mcu_a, base_a), (mcu_b, base_b));
    }

    #[test]
    fn test_updater_duration_filter() {
        let mut sync = ClockSyncRegression::new(320., 625.);
        let mut bridge = McuClock::new(1_000_000.);
        let mut updater = ChipClockUpdater::new(5);
        updater.note_start(&mut sync, 0);
        let mut report = StatusReport {
            clock: 100_000,
            query_ticks: 20,
            next_sequence: 2,
            buffered: 12,
            fifo: 1,
            limit_count: 0,
        };
        updater.update_clock(&mut sync, &mut bridge, &report);
        assert_eq!(updater.last_sequence(), 2);
        // 40 ticks allowed now; a slow query is ignored
        let before = sync.clock_translation();
        report.clock = 200_000;
        report.query_ticks = 1000;
        report.next_sequence = 4;
        updater.update_clock(&mut sync, &mut bridge, &report);
        assert_eq!(updater.last_sequence(), 4);
        assert_eq!(sync.clock_translation(), before);
    }

    #[test]
    fn test_time_translation_in_seconds() {
        let mut sync = ClockSyncRegression::new(320., 625.);
        sync.reset(2_000_000., 0.);
        let bridge = McuClock::new(1_000_000.);
        let translation = sync.time_translation(&bridge);
        assert!((translation.time_base - 2.0).abs() < 1e-9);
        assert!((translation.inv_freq - 0.000625).abs() < 1e-12);
        assert!((translation.time_of(1600.) - 3.0).abs() < 1e-9);
    }
}
