//! instantaneous block peak for VU display.
//!
//! The u/x samples these through the atomic snapshot, so the meter keeps no
//! history.  Decay/ballistics belong to whoever draws the meter.
use crate::utils::frame_peak;

pub struct PeakMeter {
    left: f32,
    right: f32,
}

impl PeakMeter {
    pub fn new() -> PeakMeter {
        PeakMeter {
            left: 0.0,
            right: 0.0,
        }
    }
    pub fn add_block(&mut self, left: &[f32], right: &[f32]) -> () {
        self.left = frame_peak(left);
        self.right = frame_peak(right);
    }
    pub fn get(&self) -> (f32, f32) {
        (self.left, self.right)
    }
}

#[cfg(test)]
mod test_peak_meter {
    use super::*;

    #[test]
    fn tracks_block_peak() {
        let mut meter = PeakMeter::new();
        meter.add_block(&[0.1, -0.5], &[0.9, 0.2]);
        assert_eq!(meter.get(), (0.5, 0.9));
        // next block replaces, no decay
        meter.add_block(&[0.0; 4], &[0.0; 4]);
        assert_eq!(meter.get(), (0.0, 0.0));
    }
}
