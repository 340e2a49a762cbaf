//! Fixed-size bitset tracking which slots of a slab are in use
//!
//! Two of these back every slab: one for slots whose constructor has run
//! ("constructed") and one for slots currently handed out ("allocated").
//! The set/clear discipline is strict: setting an already-set bit or
//! clearing an already-clear bit is a logic bug in the caller, not a
//! runtime condition, so both panic.

use crate::util::divroundup;

const WORD_BITS: u32 = u64::BITS;

pub struct Mask {
    size: u32,
    count: u32,
    bits: Vec<u64>,
}

impl Mask {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            count: 0,
            bits: vec![0; divroundup(size as usize, WORD_BITS as usize)],
        }
    }

    #[inline]
    fn word_and_bit(&self, bit: u32) -> (usize, u64) {
        assert!(bit < self.size);
        ((bit / WORD_BITS) as usize, 1u64 << (bit % WORD_BITS))
    }

    /// Set a currently-clear bit
    pub fn set(&mut self, bit: u32) {
        let (word, mask) = self.word_and_bit(bit);
        assert_eq!(self.bits[word] & mask, 0, "mask bit {} already set", bit);
        self.bits[word] |= mask;
        self.count += 1;
    }

    /// Clear a currently-set bit
    pub fn clear(&mut self, bit: u32) {
        let (word, mask) = self.word_and_bit(bit);
        assert_ne!(self.bits[word] & mask, 0, "mask bit {} already clear", bit);
        self.bits[word] &= !mask;
        self.count -= 1;
    }

    pub fn test(&self, bit: u32) -> bool {
        let (word, mask) = self.word_and_bit(bit);
        self.bits[word] & mask != 0
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Find the first clear bit at or after `start`, if any
    pub fn next_clear(&self, start: u32) -> Option<u32> {
        let mut bit = start;
        while bit < self.size {
            let word = self.bits[(bit / WORD_BITS) as usize] >> (bit % WORD_BITS);
            if word & 1 == 0 {
                return Some(bit);
            }
            // skip the contiguous run of set bits; zeros shifted in at the
            // top stop the count exactly at the next word boundary
            bit += word.trailing_ones();
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn popcount(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_count() {
        // the worked example: size 8, set 0/2/4/6, clear 2
        let mut m = Mask::new(8);
        for bit in [0, 2, 4, 6] {
            m.set(bit);
        }
        assert_eq!(m.count(), 4);
        m.clear(2);
        assert_eq!(m.count(), 3);
        assert!(!m.test(2));
        assert!(m.test(4));
        assert_eq!(m.size(), 8);
    }

    #[test]
    fn count_matches_popcount() {
        let mut m = Mask::new(200);
        let mut set = Vec::new();
        // deterministic pseudo-random walk over set/clear
        let mut x: u64 = 0x243f6a8885a308d3;
        for _ in 0..1000 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let bit = (x >> 33) as u32 % 200;
            if m.test(bit) {
                m.clear(bit);
                set.retain(|&b| b != bit);
            } else {
                m.set(bit);
                set.push(bit);
            }
            assert_eq!(m.count(), m.popcount());
            assert_eq!(m.count() as usize, set.len());
        }
    }

    #[test]
    #[should_panic]
    fn double_set_panics() {
        let mut m = Mask::new(8);
        m.set(3);
        m.set(3);
    }

    #[test]
    #[should_panic]
    fn clear_of_clear_panics() {
        let mut m = Mask::new(8);
        m.clear(0);
    }

    #[test]
    #[should_panic]
    fn out_of_range_panics() {
        let mut m = Mask::new(8);
        m.set(8);
    }

    #[test]
    fn next_clear_scan() {
        let mut m = Mask::new(130);
        assert_eq!(m.next_clear(0), Some(0));
        for bit in 0..65 {
            m.set(bit);
        }
        assert_eq!(m.next_clear(0), Some(65));
        assert_eq!(m.next_clear(64), Some(65));
        m.set(65);
        m.set(66);
        assert_eq!(m.next_clear(3), Some(67));
        for bit in 67..130 {
            m.set(bit);
        }
        assert_eq!(m.next_clear(0), None);
        assert_eq!(m.next_clear(129), None);
        m.clear(128);
        assert_eq!(m.next_clear(0), Some(128));
    }

    #[test]
    fn next_clear_word_boundary() {
        let mut m = Mask::new(64);
        for bit in 0..64 {
            m.set(bit);
        }
        assert_eq!(m.next_clear(0), None);
        m.clear(63);
        assert_eq!(m.next_clear(0), Some(63));
    }
}
