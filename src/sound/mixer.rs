//! the block mixer that runs inside the audio callback.
//!
//! Combines the monitored local input, every peer slot's decoded stream, and
//! the metronome into the stereo output bus.  All settings arrive through
//! [`MixerControls`] (word sized atomics, relaxed) so the callback never
//! takes a lock, and all peer audio arrives through the preallocated rings.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::common::atomic_float::AtomicF32;
use crate::common::spsc;

use super::channel_strip::ChannelStrip;
use super::click_track::ClickTrack;

/// peer channel slots preallocated per instance.  Subscriptions past this are
/// refused by the engine, never grown under the callback.
pub const MIXER_SLOTS: usize = 12;

/// solo mask bit for the local channel; slot `i` gets bit `i + 1`
pub const SOLO_BIT_LOCAL: u32 = 1;

pub fn solo_bit_for_slot(slot: usize) -> u32 {
    1 << (slot + 1)
}

/// Atomic knobs the u/x and worker write and the audio callback reads.
pub struct MixerControls {
    pub master_gain: AtomicF32,
    pub master_mute: AtomicBool,
    pub click_gain: AtomicF32,
    pub click_mute: AtomicBool,
    pub local_gain: AtomicF32,
    pub local_pan: AtomicF32,
    pub local_mute: AtomicBool,
    pub slot_gain: Vec<AtomicF32>,
    pub slot_pan: Vec<AtomicF32>,
    /// bit per slot
    pub slot_mute_mask: AtomicU32,
    /// empty mask means nothing is soloed
    pub solo_mask: AtomicU32,
}

impl MixerControls {
    pub fn new() -> MixerControls {
        let mut slot_gain = vec![];
        let mut slot_pan = vec![];
        for _ in 0..MIXER_SLOTS {
            slot_gain.push(AtomicF32::new(1.0));
            slot_pan.push(AtomicF32::new(0.0));
        }
        MixerControls {
            master_gain: AtomicF32::new(1.0),
            master_mute: AtomicBool::new(false),
            click_gain: AtomicF32::new(0.5),
            click_mute: AtomicBool::new(false),
            local_gain: AtomicF32::new(1.0),
            local_pan: AtomicF32::new(0.0),
            local_mute: AtomicBool::new(false),
            slot_gain,
            slot_pan,
            slot_mute_mask: AtomicU32::new(0),
            solo_mask: AtomicU32::new(0),
        }
    }
    pub fn set_slot_mute(&self, slot: usize, mute: bool) -> () {
        let bit = 1u32 << slot;
        if mute {
            self.slot_mute_mask.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.slot_mute_mask.fetch_and(!bit, Ordering::Relaxed);
        }
    }
}

pub struct RtMixer {
    controls: Arc<MixerControls>,
    local_strip: ChannelStrip,
    slot_strips: Vec<ChannelStrip>,
    slot_rx: Vec<spsc::Consumer<[f32; 2]>>,
    click: ClickTrack,
    scratch: Vec<[f32; 2]>,
}

impl RtMixer {
    pub fn new(
        sample_rate: u32,
        max_block: usize,
        controls: Arc<MixerControls>,
        slot_rx: Vec<spsc::Consumer<[f32; 2]>>,
    ) -> RtMixer {
        let mut slot_strips = vec![];
        for _ in 0..slot_rx.len() {
            slot_strips.push(ChannelStrip::new());
        }
        RtMixer {
            controls,
            local_strip: ChannelStrip::new(),
            slot_strips,
            slot_rx,
            click: ClickTrack::new(sample_rate),
            scratch: vec![[0.0, 0.0]; max_block],
        }
    }

    /// Produce one block of the jam mix.  `start_pos`/`len`/`bpi` describe
    /// the interval clock at the first frame.  Never allocates.
    pub fn mix(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
        start_pos: u32,
        len: u32,
        bpi: u32,
    ) -> () {
        let n = out_a
            .len()
            .min(out_b.len())
            .min(in_a.len())
            .min(in_b.len())
            .min(self.scratch.len());
        for v in out_a[..n].iter_mut() {
            *v = 0.0;
        }
        for v in out_b[..n].iter_mut() {
            *v = 0.0;
        }
        let solo = self.controls.solo_mask.load(Ordering::Relaxed);
        let mutes = self.controls.slot_mute_mask.load(Ordering::Relaxed);

        // monitored local input, gain applied after the raw stream went out
        let local_solo_ok = solo == 0 || solo & SOLO_BIT_LOCAL != 0;
        let local_audible = !self.controls.local_mute.load(Ordering::Relaxed) && local_solo_ok;
        self.local_strip.configure(
            self.controls.local_gain.load(),
            self.controls.local_pan.load(),
            !local_audible,
        );
        for i in 0..n {
            self.scratch[i] = [in_a[i], in_b[i]];
        }
        self.local_strip.mix_into(&self.scratch[..n], out_a, out_b);

        // peer slots: the ring drains every block even when inaudible so the
        // stream stays aligned with the interval clock
        for slot in 0..self.slot_rx.len() {
            let got = self.slot_rx[slot].pop_slice(&mut self.scratch[..n]);
            for f in self.scratch[got..n].iter_mut() {
                *f = [0.0, 0.0];
            }
            let solo_ok = solo == 0 || solo & solo_bit_for_slot(slot) != 0;
            let audible = mutes & (1 << slot) == 0 && solo_ok;
            self.slot_strips[slot].configure(
                self.controls.slot_gain[slot].load(),
                self.controls.slot_pan[slot].load(),
                !audible,
            );
            self.slot_strips[slot].mix_into(&self.scratch[..n], out_a, out_b);
        }

        self.click.mix_into(
            &mut out_a[..n],
            &mut out_b[..n],
            start_pos,
            len,
            bpi,
            self.controls.click_gain.load(),
            self.controls.click_mute.load(Ordering::Relaxed),
        );
    }

    pub fn reset_click(&mut self) -> () {
        self.click.reset();
    }
}
