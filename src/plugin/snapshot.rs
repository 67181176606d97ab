//! flat record of word sized atomics the u/x samples every frame.
//!
//! Writers use relaxed ordering; each field stands alone and mild skew
//! between them is fine for meters and a beat display.  Transport values are
//! stored by the worker after each engine tick, the VU pairs by the audio
//! callback during the block that produced them.
use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::atomic_float::{AtomicF32, AtomicF32Pair};

pub struct UiSnapshot {
    pub bpm: AtomicF32,
    pub bpi: AtomicU32,
    pub interval_position: AtomicU32,
    pub interval_length: AtomicU32,
    pub beat: AtomicU32,
    pub master_vu_lr: AtomicF32Pair,
    pub local_vu_lr: AtomicF32Pair,
}

impl UiSnapshot {
    pub fn new() -> UiSnapshot {
        UiSnapshot {
            bpm: AtomicF32::new(0.0),
            bpi: AtomicU32::new(0),
            interval_position: AtomicU32::new(0),
            interval_length: AtomicU32::new(0),
            beat: AtomicU32::new(0),
            master_vu_lr: AtomicF32Pair::new(0.0, 0.0),
            local_vu_lr: AtomicF32Pair::new(0.0, 0.0),
        }
    }
    pub fn clear(&self) -> () {
        self.bpm.store(0.0);
        self.bpi.store(0, Ordering::Relaxed);
        self.interval_position.store(0, Ordering::Relaxed);
        self.interval_length.store(0, Ordering::Relaxed);
        self.beat.store(0, Ordering::Relaxed);
        self.master_vu_lr.store(0.0, 0.0);
        self.local_vu_lr.store(0.0, 0.0);
    }
}

#[cfg(test)]
mod test_snapshot {
    use super::*;

    #[test]
    fn fields_read_back() {
        let snap = UiSnapshot::new();
        snap.bpm.store(120.0);
        snap.bpi.store(16, Ordering::Relaxed);
        snap.master_vu_lr.store(0.5, 0.25);
        assert_eq!(snap.bpm.load(), 120.0);
        assert_eq!(snap.bpi.load(Ordering::Relaxed), 16);
        assert_eq!(snap.master_vu_lr.load(), (0.5, 0.25));
        snap.clear();
        assert_eq!(snap.bpm.load(), 0.0);
        assert_eq!(snap.master_vu_lr.load(), (0.0, 0.0));
    }
}
