//! metronome clicks locked to the interval clock.
//!
//! Beat placement is pure integer math on the interval position so a long
//! session can't drift: beat k of an interval of `len` frames starts the
//! sample where `pos * bpi / len` ticks over to k.  Beat zero gets the
//! accented tic, the rest get the toc.  The two tables are rendered once at
//! activation; the audio callback only indexes into them.
use crate::dsp::osc::SineOsc;

pub struct ClickTrack {
    tic: Vec<f32>,
    toc: Vec<f32>,
    last_beat: u64,
    idx: usize,
    accent: bool,
}

/// click length in seconds; a new beat retriggers an unfinished click
const CLICK_SECONDS: f32 = 0.06;

impl ClickTrack {
    pub fn new(sample_rate: u32) -> ClickTrack {
        let n = (sample_rate as f32 * CLICK_SECONDS) as usize;
        let mut tic_osc = SineOsc::new(1320.0, 1.0, sample_rate as f32);
        let mut toc_osc = SineOsc::new(880.0, 0.7, sample_rate as f32);
        ClickTrack {
            tic: tic_osc.render_burst(n),
            toc: toc_osc.render_burst(n),
            last_beat: u64::MAX,
            idx: usize::MAX,
            accent: false,
        }
    }

    pub fn reset(&mut self) -> () {
        self.last_beat = u64::MAX;
        self.idx = usize::MAX;
    }

    /// mix clicks for a block starting at `start_pos` of an interval of
    /// `len` frames with `bpi` beats
    pub fn mix_into(
        &mut self,
        out_a: &mut [f32],
        out_b: &mut [f32],
        start_pos: u32,
        len: u32,
        bpi: u32,
        gain: f32,
        mute: bool,
    ) -> () {
        if len == 0 || bpi == 0 {
            return;
        }
        let frames = out_a.len().min(out_b.len());
        for i in 0..frames {
            // position may wrap inside the block
            let pos = (start_pos as u64 + i as u64) % len as u64;
            let beat = pos * bpi as u64 / len as u64;
            if beat != self.last_beat {
                self.last_beat = beat;
                self.idx = 0;
                self.accent = beat == 0;
            }
            let table = if self.accent { &self.tic } else { &self.toc };
            if self.idx < table.len() {
                if !mute {
                    let v = gain * table[self.idx];
                    out_a[i] += v;
                    out_b[i] += v;
                }
                self.idx += 1;
            }
        }
    }
}
