//! the four host automatable parameters.
//!
//! The host delivers timestamped change events in the process call; the
//! audio path stores each one into its atomic at (or before) the event's
//! frame.  Master volume additionally gets segment-accurate application so
//! automation ramps land where the host put them.
use num_derive::{FromPrimitive, ToPrimitive};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::atomic_float::AtomicF32;
use crate::utils::{clip_volume, volume_to_db};

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum ParamId {
    MasterVolume = 0,
    MasterMute = 1,
    MetronomeVolume = 2,
    MetronomeMute = 3,
}

pub const PARAM_COUNT: usize = 4;

/// one timestamped change from the host's event stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamEvent {
    pub frame: usize,
    pub id: ParamId,
    pub value: f32,
}

/// current parameter values, host/u-x side
pub struct ParamStore {
    master_volume: AtomicF32,
    master_mute: AtomicBool,
    metronome_volume: AtomicF32,
    metronome_mute: AtomicBool,
}

impl ParamStore {
    pub fn new() -> ParamStore {
        ParamStore {
            master_volume: AtomicF32::new(1.0),
            master_mute: AtomicBool::new(false),
            metronome_volume: AtomicF32::new(0.5),
            metronome_mute: AtomicBool::new(false),
        }
    }
    pub fn set(&self, id: ParamId, value: f32) -> () {
        match id {
            ParamId::MasterVolume => self.master_volume.store(clip_volume(value)),
            ParamId::MasterMute => self.master_mute.store(value >= 0.5, Ordering::Relaxed),
            ParamId::MetronomeVolume => self.metronome_volume.store(clip_volume(value)),
            ParamId::MetronomeMute => self.metronome_mute.store(value >= 0.5, Ordering::Relaxed),
        }
    }
    pub fn get(&self, id: ParamId) -> f32 {
        match id {
            ParamId::MasterVolume => self.master_volume.load(),
            ParamId::MasterMute => self.master_mute.load(Ordering::Relaxed) as u32 as f32,
            ParamId::MetronomeVolume => self.metronome_volume.load(),
            ParamId::MetronomeMute => self.metronome_mute.load(Ordering::Relaxed) as u32 as f32,
        }
    }
    /// host display string for a parameter value
    pub fn display(id: ParamId, value: f32) -> String {
        match id {
            ParamId::MasterVolume | ParamId::MetronomeVolume => {
                if value <= 0.0 {
                    String::from("-inf dB")
                } else {
                    format!("{:.1} dB", volume_to_db(value))
                }
            }
            ParamId::MasterMute | ParamId::MetronomeMute => {
                String::from(if value >= 0.5 { "on" } else { "off" })
            }
        }
    }
}

#[cfg(test)]
mod test_params {
    use super::*;
    use num::FromPrimitive;

    #[test]
    fn ids_map_to_params() {
        assert_eq!(ParamId::from_u32(0), Some(ParamId::MasterVolume));
        assert_eq!(ParamId::from_u32(3), Some(ParamId::MetronomeMute));
        assert_eq!(ParamId::from_u32(9), None);
    }
    #[test]
    fn set_and_get() {
        let store = ParamStore::new();
        store.set(ParamId::MasterVolume, 0.5);
        assert_eq!(store.get(ParamId::MasterVolume), 0.5);
        store.set(ParamId::MasterMute, 1.0);
        assert_eq!(store.get(ParamId::MasterMute), 1.0);
        // out of range volume clamps to the parameter range
        store.set(ParamId::MetronomeVolume, 5.0);
        assert_eq!(store.get(ParamId::MetronomeVolume), 2.0);
    }
    #[test]
    fn display_strings() {
        assert_eq!(ParamStore::display(ParamId::MasterVolume, 0.0), "-inf dB");
        assert_eq!(ParamStore::display(ParamId::MasterVolume, 1.0), "0.0 dB");
        assert_eq!(ParamStore::display(ParamId::MasterMute, 1.0), "on");
    }
}
