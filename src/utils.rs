//! grab bag of functions used across the board
use std::time::{SystemTime, UNIX_EPOCH};

/// microsecond timestamp used by all the worker side timers
pub fn get_micro_time() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros()
}

/// Convert a linear volume to dB for display.  0.0 maps to -100dB which the
/// u/x treats as -infinity.
pub fn volume_to_db(v: f32) -> f32 {
    if v <= 0.0 {
        return -100.0;
    }
    (20.0 * f32::log10(v)).clamp(-100.0, 12.0)
}

/// clamp a fader/pan style value into [-1.0, 1.0]
pub fn clip_float(v: f32) -> f32 {
    v.clamp(-1.0, 1.0)
}

/// clamp a linear volume into the range the mixer supports
pub fn clip_volume(v: f32) -> f32 {
    v.clamp(0.0, 2.0)
}

/// Peak absolute sample value of a frame
pub fn frame_peak(frame: &[f32]) -> f32 {
    let mut peak: f32 = 0.0;
    for v in frame {
        let a = v.abs();
        if a > peak {
            peak = a;
        }
    }
    peak
}
