//! the host audio callback path.
//!
//! Runs on the host's real time thread under its deadline: no allocation, no
//! locks, no I/O.  When the session isn't joined the block passes input
//! straight to output.  When joined it ships input PCM toward the worker,
//! mixes the jam, applies the master section with event-accurate volume, and
//! publishes the meters.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::common::spsc;
use crate::dsp::peak_meter::PeakMeter;
use crate::ninjam::engine::EngineShared;
use crate::ninjam::STATE_JOINED;
use crate::sound::mixer::{MixerControls, RtMixer};

use super::params::{ParamEvent, ParamId, ParamStore};
use super::snapshot::UiSnapshot;
use super::write_param;

/// what the process call tells the host
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessStatus {
    Continue,
    Error,
}

/// host transport flags handed into every process call
#[derive(Debug, Clone, Copy, Default)]
pub struct Transport {
    pub playing: bool,
    pub seeking: bool,
    pub song_pos_frames: u64,
}

pub struct AudioPath {
    shared: Arc<EngineShared>,
    controls: Arc<MixerControls>,
    params: Arc<ParamStore>,
    snapshot: Arc<UiSnapshot>,
    mixer: RtMixer,
    xmit_tx: spsc::Producer<[f32; 2]>,
    frame_buf: Vec<[f32; 2]>,
    local_meter: PeakMeter,
    master_meter: PeakMeter,
    max_block: usize,
}

impl AudioPath {
    pub fn new(
        sample_rate: u32,
        max_block: usize,
        shared: Arc<EngineShared>,
        controls: Arc<MixerControls>,
        params: Arc<ParamStore>,
        snapshot: Arc<UiSnapshot>,
        xmit_tx: spsc::Producer<[f32; 2]>,
        slot_rx: Vec<spsc::Consumer<[f32; 2]>>,
    ) -> AudioPath {
        AudioPath {
            shared: shared.clone(),
            controls: controls.clone(),
            params,
            snapshot,
            mixer: RtMixer::new(sample_rate, max_block, controls, slot_rx),
            xmit_tx,
            frame_buf: vec![[0.0, 0.0]; max_block],
            local_meter: PeakMeter::new(),
            master_meter: PeakMeter::new(),
            max_block,
        }
    }

    /// One block.  Slices must all be the host's frame count; anything past
    /// the activated maximum is left untouched.
    pub fn process(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
        _transport: &Transport,
        events: &[ParamEvent],
    ) -> ProcessStatus {
        let frames = in_a.len().min(in_b.len()).min(out_a.len()).min(out_b.len());
        if frames == 0 {
            return ProcessStatus::Continue;
        }
        let n = frames.min(self.max_block);

        let state = self.shared.state.load(Ordering::Acquire);
        if state != STATE_JOINED {
            // events still land in the atomics, then pass-through
            for ev in events {
                write_param(&self.params, &self.controls, ev.id, ev.value);
            }
            out_a[..n].copy_from_slice(&in_a[..n]);
            out_b[..n].copy_from_slice(&in_b[..n]);
            return ProcessStatus::Continue;
        }

        // everything except master volume applies at block start, which is
        // at-or-before any timestamp in the block
        for ev in events {
            if ev.id != ParamId::MasterVolume {
                write_param(&self.params, &self.controls, ev.id, ev.value);
            }
        }

        // raw input goes to the encoder before any monitor shaping
        for i in 0..n {
            self.frame_buf[i] = [in_a[i], in_b[i]];
        }
        self.xmit_tx.push_slice(&self.frame_buf[..n]);
        self.local_meter.add_block(&in_a[..n], &in_b[..n]);
        let (ll, lr) = self.local_meter.get();
        self.snapshot.local_vu_lr.store(ll, lr);

        let pos = self.shared.interval_pos.load(Ordering::Relaxed);
        let len = self.shared.interval_len.load(Ordering::Relaxed);
        let bpi = self.shared.bpi.load(Ordering::Relaxed);
        self.mixer.mix(
            &in_a[..n],
            &in_b[..n],
            &mut out_a[..n],
            &mut out_b[..n],
            pos,
            len,
            bpi,
        );
        self.advance_clock(pos, len, n as u32);

        self.apply_master(out_a, out_b, n, events);

        self.master_meter.add_block(&out_a[..n], &out_b[..n]);
        let (ml, mr) = self.master_meter.get();
        self.snapshot.master_vu_lr.store(ml, mr);
        ProcessStatus::Continue
    }

    /// move the interval clock by one block, adopting a new length only at
    /// the boundary
    fn advance_clock(&mut self, pos: u32, mut len: u32, frames: u32) -> () {
        if len == 0 {
            return;
        }
        let mut new_pos = pos + frames;
        while new_pos >= len {
            new_pos -= len;
            let next = self.shared.next_interval_len.load(Ordering::Relaxed);
            if next != 0 && next != len {
                len = next;
                self.shared.interval_len.store(len, Ordering::Relaxed);
            }
            if len == 0 {
                new_pos = 0;
                break;
            }
        }
        self.shared.interval_pos.store(new_pos, Ordering::Relaxed);
    }

    /// master gain segmented on volume events so automation lands on its
    /// frame, then the mute short circuit
    fn apply_master(
        &mut self,
        out_a: &mut [f32],
        out_b: &mut [f32],
        n: usize,
        events: &[ParamEvent],
    ) -> () {
        let mut gain = self.controls.master_gain.load();
        let mut seg = 0usize;
        for ev in events {
            if ev.id != ParamId::MasterVolume {
                continue;
            }
            let at = ev.frame.min(n);
            for i in seg..at {
                out_a[i] *= gain;
                out_b[i] *= gain;
            }
            seg = at;
            write_param(&self.params, &self.controls, ev.id, ev.value);
            gain = self.controls.master_gain.load();
        }
        for i in seg..n {
            out_a[i] *= gain;
            out_b[i] *= gain;
        }
        if self.controls.master_mute.load(Ordering::Relaxed) {
            for i in 0..n {
                out_a[i] = 0.0;
                out_b[i] = 0.0;
            }
        }
    }

    /// host is re-starting the session clockwork
    pub fn reset(&mut self) -> () {
        self.mixer.reset_click();
    }
}
