//! word sized atomic cells for values the audio callback reads without locks.
//!
//! Everything the real time path observes is either one of these or a plain
//! integer atomic, so a torn read is impossible by construction.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// f32 stored as its bit pattern in an AtomicU32
pub struct AtomicF32 {
    bits: AtomicU32,
}

impl AtomicF32 {
    pub fn new(v: f32) -> AtomicF32 {
        AtomicF32 {
            bits: AtomicU32::new(v.to_bits()),
        }
    }
    pub fn store(&self, v: f32) -> () {
        self.bits.store(v.to_bits(), Ordering::Relaxed);
    }
    pub fn load(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// stereo pair of f32 packed into one AtomicU64 so both sides of a meter
/// always come from the same block
pub struct AtomicF32Pair {
    bits: AtomicU64,
}

impl AtomicF32Pair {
    pub fn new(l: f32, r: f32) -> AtomicF32Pair {
        AtomicF32Pair {
            bits: AtomicU64::new(Self::pack(l, r)),
        }
    }
    fn pack(l: f32, r: f32) -> u64 {
        ((l.to_bits() as u64) << 32) | r.to_bits() as u64
    }
    pub fn store(&self, l: f32, r: f32) -> () {
        self.bits.store(Self::pack(l, r), Ordering::Relaxed);
    }
    pub fn load(&self) -> (f32, f32) {
        let v = self.bits.load(Ordering::Relaxed);
        (f32::from_bits((v >> 32) as u32), f32::from_bits(v as u32))
    }
}

#[cfg(test)]
mod test_atomic_float {
    use super::*;

    #[test]
    fn round_trip() {
        let v = AtomicF32::new(0.5);
        assert_eq!(v.load(), 0.5);
        v.store(-1.25);
        assert_eq!(v.load(), -1.25);
    }
    #[test]
    fn pair_round_trip() {
        let v = AtomicF32Pair::new(0.0, 0.0);
        v.store(0.25, -0.75);
        assert_eq!(v.load(), (0.25, -0.75));
    }
}
