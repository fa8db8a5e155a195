// Sequence reconciliation for firmware block counters
//
// The firmware only sends the low 16 bits of its block counter. Received
// blocks are extended against the newest one seen, so consecutive blocks must
// be less than half a wrap (32768 blocks) apart. Counters that only move
// forward may advance up to one full wrap. Neither limit is checked.

use crate::config::{BYTES_PER_SAMPLE, SAMPLES_PER_BLOCK};

/// Extend a 16-bit wrapping counter against the last full value
///
/// Never returns a value below `last`.
pub fn extend_u16(last: u64, received: u16) -> u64 {
    let candidate = (last & !0xFFFF) | received as u64;
    if candidate < last {
        candidate + 0x10000
    } else {
        candidate
    }
}

/// Extend a 16-bit block counter that may arrive out of order by less than
/// half its range.
pub fn extend_u16_signed(last: u64, received: u16) -> u64 {
    let diff = received.wrapping_sub(last as u16) as i16 as i64;
    (last as i64 + diff).max(0) as u64
}

/// Extend a 32-bit counter (e.g. a firmware clock) that may move either way
/// by less than half its range.
pub fn extend_u32_signed(last: u64, received: u32) -> u64 {
    let diff = received.wrapping_sub(last as u32) as i32 as i64;
    (last as i64 + diff).max(0) as u64
}

/// Block counter rebuilt from 16-bit observations
///
/// A late block extends to just behind the newest one and leaves the
/// counter where it was.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceState {
    last_count: u64,
}

impl SequenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a received sequence number and return its extended value
    pub fn observe(&mut self, received: u16) -> u64 {
        let extended = extend_u16_signed(self.last_count, received);
        self.last_count = self.last_count.max(extended);
        extended
    }

    /// Extend without updating the state (e.g. the final sequence of a stop reply)
    pub fn convert(&self, received: u16) -> u64 {
        extend_u16(self.last_count, received)
    }

    pub fn last_count(&self) -> u64 {
        self.last_count
    }

    pub fn reset(&mut self) {
        self.last_count = 0;
    }
}

/// Samples the firmware produced in a session ending at `end_sequence`
///
/// `end_sequence` is the next (unsent) sequence number; every block but the
/// last is full.
pub fn expected_samples(end_sequence: u64, last_block_len: usize) -> u64 {
    if end_sequence == 0 {
        return 0;
    }
    (end_sequence - 1) * SAMPLES_PER_BLOCK as u64 + (last_block_len / BYTES_PER_SAMPLE) as u64
}

/// Samples lost between the firmware and the decoded output
pub fn drop_count(expected: u64, received: u64) -> u64 {
    expected.saturating_sub(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_across_wraps() {
        let mut truth = 0u64;
        let mut last = 0u64;
        // Steps up to a full wrap minus one block
        for step in [1u64, 7, 300, 65_000, 2, 65_535, 1, 40_000, 40_000] {
            truth += step;
            let extended = extend_u16(last, truth as u16);
            assert_eq!(extended, truth);
            last = extended;
        }

        let mut state = SequenceState::new();
        let mut truth = 0u64;
        for step in [1u64, 300, 30_000, 32_000, 5, 32_767] {
            truth += step;
            assert_eq!(state.observe(truth as u16), truth);
        }
    }

    #[test]
    fn test_late_block_lands_behind_newest() {
        let mut state = SequenceState::new();
        let extended: Vec<u64> = [0u16, 1, 3, 2, 4].iter().map(|&s| state.observe(s)).collect();
        assert_eq!(extended, vec![0, 1, 3, 2, 4]);
        assert_eq!(state.last_count(), 4);

        // Around a wrap
        let mut state = SequenceState::new();
        for s in [0x4000, 0x8000, 0xC000, 0xFFFE] {
            state.observe(s);
        }
        assert_eq!(state.observe(0x0001), 0x1_0001);
        assert_eq!(state.observe(0xFFFF), 0xFFFF);
        assert_eq!(state.last_count(), 0x1_0001);
    }

    #[test]
    fn test_repeated_value_does_not_advance() {
        let mut state = SequenceState::new();
        state.observe(5);
        assert_eq!(state.observe(5), 5);
        assert_eq!(state.convert(4), 0x10004);
    }

    #[test]
    fn test_extend_u32_signed() {
        assert_eq!(extend_u32_signed(0x1_0000_0010, 0x20), 0x1_0000_0020);
        assert_eq!(extend_u32_signed(0x1_0000_0010, 0x08), 0x1_0000_0008);
        assert_eq!(extend_u32_signed(0xFFFF_FFF0, 0x10), 0x1_0000_0010);
    }

    #[test]
    fn test_expected_and_drops() {
        assert_eq!(expected_samples(0, 0), 0);
        assert_eq!(expected_samples(10, 48), 80);
        assert_eq!(expected_samples(10, 12), 74);
        assert_eq!(drop_count(80, 72), 8);
        assert_eq!(drop_count(80, 80), 0);
        assert_eq!(drop_count(3, 80), 0);
    }
}
