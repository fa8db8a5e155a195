// Sample decoding: raw firmware blocks -> time-stamped samples in mm/s^2

use serde::{Deserialize, Serialize};

use crate::axes::AxisMap;
use crate::clock::TimeTranslation;
use crate::config::{BYTES_PER_SAMPLE, SAMPLES_PER_BLOCK};

/// One decoded measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Sample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// A firmware data block with its sequence already extended
#[derive(Debug, Clone, PartialEq)]
pub struct RawBlock {
    pub sequence: u64,
    pub data: Vec<u8>,
}

impl RawBlock {
    /// Whole samples in the block; trailing bytes are ignored
    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }
}

/// Uniform timing recovered after a session ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalTiming {
    /// Host time of the first sample
    pub start_time: f64,
    pub time_per_sample: f64,
}

/// Little-endian two's-complement word, sign-extended from `bits`
pub fn decode_word(lo: u8, hi: u8, bits: u32) -> i32 {
    let shift = 32 - bits.clamp(1, 16);
    let raw = u16::from_le_bytes([lo, hi]) as i32;
    (raw << shift) >> shift
}

/// Decode one 6-byte group into raw (x, y, z) counts
pub fn decode_raw(chunk: &[u8], bits: u32) -> [i32; 3] {
    [
        decode_word(chunk[0], chunk[1], bits),
        decode_word(chunk[2], chunk[3], bits),
        decode_word(chunk[4], chunk[5], bits),
    ]
}

/// Inverse of `decode_raw` (for simulation and tests)
pub fn encode_raw(raw: [i32; 3]) -> Vec<u8> {
    raw.iter()
        .flat_map(|&v| (v.clamp(i16::MIN as i32, i16::MAX as i32) as i16).to_le_bytes())
        .collect()
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.).round() / 1_000_000.
}

/// Deferred decode with uniform spacing between two session anchors
pub fn decode_interval(
    blocks: &[RawBlock],
    axes: &AxisMap,
    bits: u32,
    timing: IntervalTiming,
) -> Vec<Sample> {
    let tps = timing.time_per_sample;
    let seq_to_time = tps * SAMPLES_PER_BLOCK as f64;
    let mut samples = Vec::with_capacity(blocks.len() * SAMPLES_PER_BLOCK);
    for block in blocks {
        let seq_time = timing.start_time + block.sequence as f64 * seq_to_time;
        for (i, chunk) in block.data.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
            let [x, y, z] = axes.apply(decode_raw(chunk, bits));
            samples.push(Sample {
                time: seq_time + i as f64 * tps,
                x,
                y,
                z,
            });
        }
    }
    samples
}

/// Incremental decode against the live clock regression
///
/// Returns the samples and the chip tick of the last one, which the caller
/// feeds back to the synchronizer.
pub fn decode_regression(
    blocks: &[RawBlock],
    axes: &AxisMap,
    bits: u32,
    translation: TimeTranslation,
) -> (Vec<Sample>, Option<u64>) {
    let TimeTranslation {
        time_base,
        chip_base,
        inv_freq,
    } = translation;
    let mut samples = Vec::with_capacity(blocks.len() * SAMPLES_PER_BLOCK);
    let mut last_tick = None;
    for block in blocks {
        let block_tick = block.sequence * SAMPLES_PER_BLOCK as u64;
        let msg_cdiff = block_tick as f64 - chip_base;
        for (i, chunk) in block.data.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
            let [x, y, z] = axes.apply(decode_raw(chunk, bits));
            samples.push(Sample {
                time: round6(time_base + (msg_cdiff + i as f64) * inv_freq),
                x: round6(x),
                y: round6(y),
                z: round6(z),
            });
            last_tick = Some(block_tick + i as u64);
        }
    }
    (samples, last_tick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_word_sign_extension() {
        assert_eq!(decode_word(0xFF, 0xFF, 16), -1);
        assert_eq!(decode_word(0x00, 0x80, 16), -32768);
        assert_eq!(decode_word(0x34, 0x12, 16), 0x1234);
        // 13-bit right-justified: bit 12 is the sign
        assert_eq!(decode_word(0x00, 0x10, 13), -4096);
        assert_eq!(decode_word(0xFF, 0x0F, 13), 4095);
    }

    #[test]
    fn test_inverse_scale_round_trip() {
        let axes = AxisMap::parse("-y,z,x", 38.246).unwrap();
        let wanted = [1234.5, -9806.65, 40.0];
        let block = RawBlock {
            sequence: 0,
            data: encode_raw(axes.unapply(wanted)),
        };
        let timing = IntervalTiming {
            start_time: 0.,
            time_per_sample: 0.001,
        };
        let samples = decode_interval(&[block], &axes, 16, timing);
        assert_eq!(samples.len(), 1);
        let got = [samples[0].x, samples[0].y, samples[0].z];
        for (g, w) in got.iter().zip(wanted) {
            // within half a count of quantization
            assert!((g - w).abs() <= 38.246 / 2. + 1e-9, "{} vs {}", g, w);
        }
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let axes = AxisMap::identity(1.0);
        let mut data = encode_raw([1, 2, 3]);
        data.extend_from_slice(&[9, 9, 9, 9]);
        let block = RawBlock { sequence: 0, data };
        assert_eq!(block.sample_count(), 1);
        let timing = IntervalTiming {
            start_time: 0.,
            time_per_sample: 1.,
        };
        let samples = decode_interval(&[block], &axes, 16, timing);
        assert_eq!(samples.len(), 1);
        assert_eq!((samples[0].x, samples[0].y, samples[0].z), (1., 2., 3.));
    }

    #[test]
    fn test_interval_timestamps_follow_sequence() {
        let axes = AxisMap::identity(1.0);
        let block = |sequence| RawBlock {
            sequence,
            data: encode_raw([0, 0, 0]).repeat(SAMPLES_PER_BLOCK),
        };
        let timing = IntervalTiming {
            start_time: 10.,
            time_per_sample: 0.5,
        };
        // Block 1 missing
        let samples = decode_interval(&[block(0), block(2)], &axes, 16, timing);
        assert_eq!(samples.len(), 16);
        assert_eq!(samples[0].time, 10.);
        assert_eq!(samples[7].time, 13.5);
        assert_eq!(samples[8].time, 18.);
    }

    #[test]
    fn test_regression_timestamps_and_rounding() {
        let axes = AxisMap::identity(0.1234567);
        let block = RawBlock {
            sequence: 2,
            data: encode_raw([1, 0, 0]).repeat(2),
        };
        let translation = TimeTranslation {
            time_base: 5.0,
            chip_base: 16.0,
            inv_freq: 0.000625,
        };
        let (samples, last_tick) = decode_regression(&[block], &axes, 16, translation);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].time, 5.0);
        assert_eq!(samples[1].time, 5.000625);
        assert_eq!(samples[0].x, 0.123457);
        assert_eq!(last_tick, Some(17));
    }
}
