//! phase accumulator sine oscillator.
//!
//! Only job is rendering the metronome tic and toc tables at activation time,
//! so it stays f32 and minimal.
pub struct SineOsc {
    amp: f32,
    phase_inc: f32,
    phase: f32,
}

const TWO_PI: f32 = std::f32::consts::PI * 2.0;

impl SineOsc {
    pub fn new(freq: f32, amp: f32, sample_rate: f32) -> SineOsc {
        SineOsc {
            amp,
            phase_inc: TWO_PI * freq / sample_rate,
            phase: 0.0,
        }
    }
    pub fn get_sample(&mut self) -> f32 {
        let val = self.amp * f32::sin(self.phase);
        self.phase += self.phase_inc;
        if self.phase >= TWO_PI {
            self.phase -= TWO_PI;
        }
        val
    }
    /// render n samples with a linear fade out over the tail half
    pub fn render_burst(&mut self, n: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(n);
        let half = n / 2;
        for i in 0..n {
            let env = if i < half || n < 2 {
                1.0
            } else {
                (n - 1 - i) as f32 / (n - 1 - half).max(1) as f32
            };
            out.push(env * self.get_sample());
        }
        out
    }
}

#[cfg(test)]
mod test_osc {
    use super::*;

    #[test]
    fn makes_a_wave() {
        let mut osc = SineOsc::new(1000.0, 1.0, 48_000.0);
        let first = osc.get_sample();
        assert_eq!(first, 0.0);
        let mut peak: f32 = 0.0;
        for _ in 0..48 {
            peak = peak.max(osc.get_sample().abs());
        }
        assert!(peak > 0.9);
    }
    #[test]
    fn burst_fades_out() {
        let mut osc = SineOsc::new(330.0, 1.0, 48_000.0);
        let burst = osc.render_burst(1000);
        assert_eq!(burst.len(), 1000);
        assert_eq!(*burst.last().unwrap(), 0.0);
    }
}
