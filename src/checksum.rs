//! Block checksums for the delta protocol

use serde::{Deserialize, Serialize};

use crate::hash::Digest;

/// Per-byte offset added by rsync
const CHAR_OFFSET: u32 = 31;

/// Fast rolling checksum (rsync's get_checksum1).
///
/// `s1` sums the window bytes, `s2` sums the running `s1` values; both wrap.
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    window: u32,
}

impl RollingChecksum {
    pub fn new(window: usize) -> Self {
        Self {
            s1: 0,
            s2: 0,
            window: window as u32,
        }
    }

    /// Reset the checksum to cover exactly `data`
    pub fn init(&mut self, data: &[u8]) {
        self.s1 = 0;
        self.s2 = 0;
        for &byte in data {
            self.s1 = self.s1.wrapping_add(byte as u32 + CHAR_OFFSET);
            self.s2 = self.s2.wrapping_add(self.s1);
        }
    }

    /// Slide the window one byte: drop `old_byte`, append `new_byte`
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        let old = old_byte as u32 + CHAR_OFFSET;
        let new = new_byte as u32 + CHAR_OFFSET;

        self.s1 = self.s1.wrapping_sub(old).wrapping_add(new);
        self.s2 = self
            .s2
            .wrapping_sub(self.window.wrapping_mul(old))
            .wrapping_add(self.s1);
    }

    /// rsync format: s1 in lower 16 bits, s2 in upper 16 bits
    pub fn value(&self) -> u32 {
        (self.s1 & 0xFFFF) | (self.s2 << 16)
    }
}

/// Weak checksum of a whole block
pub fn weak_checksum(data: &[u8]) -> u32 {
    let mut checksum = RollingChecksum::new(data.len());
    checksum.init(data);
    checksum.value()
}

/// Checksum pair for one fixed-size block of the receiver's current copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChecksum {
    pub offset: u64,
    pub length: u32,
    pub weak: u32,
    pub strong: Digest,
}

impl BlockChecksum {
    pub fn of(offset: u64, block: &[u8]) -> Self {
        Self {
            offset,
            length: block.len() as u32,
            weak: weak_checksum(block),
            strong: Digest::of(block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_checksum_is_stable() {
        let data = b"Hello, World!";
        assert_eq!(weak_checksum(data), weak_checksum(data));
        assert_ne!(weak_checksum(data), weak_checksum(b"Hello, World?"));
    }

    #[test]
    fn test_rolling_matches_fresh_checksum() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let window = 8;
        let mut rolling = RollingChecksum::new(window);
        rolling.init(&data[..window]);

        for start in 1..=data.len() - window {
            rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(
                rolling.value(),
                weak_checksum(&data[start..start + window]),
                "window at {start}"
            );
        }
    }

    #[test]
    fn test_block_checksum_of() {
        let block = BlockChecksum::of(4096, b"abcd");
        assert_eq!(block.offset, 4096);
        assert_eq!(block.length, 4);
        assert_eq!(block.strong, Digest::of(b"abcd"));
    }
}
