//! the plugin instance: owner of the engine, the worker, and all the
//! lock-free plumbing between the three threads.
//!
//! A host binding creates one [`NinjamPlugin`] per plugin instance, calls
//! `activate` / `deactivate` around processing, hands every audio block to
//! `process`, and drives the u/x off `drain_events`, the snapshot, and the
//! license slot.  Nothing here is shared between instances.
use log::info;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::common::box_error::BoxError;
use crate::common::settings::SavedSettings;
use crate::common::spsc;
use crate::ninjam::codec::CodecKind;
use crate::ninjam::engine::{ChannelChange, EngineShared, NinjamEngine};
use crate::ninjam::peers::PeerUser;
use crate::ninjam::{Session, SessionError, UiEvent};
use crate::sound::mixer::{MixerControls, MIXER_SLOTS};
use crate::utils::clip_volume;

pub mod audio_path;
pub mod license;
pub mod params;
pub mod snapshot;
pub mod worker;

use audio_path::{AudioPath, ProcessStatus, Transport};
use license::LicenseSlot;
use params::{ParamEvent, ParamId, ParamStore};
use snapshot::UiSnapshot;
use worker::WorkerHandle;

/// frames of outgoing PCM the audio thread can bank before the worker drains
const XMIT_RING_FRAMES: usize = 1 << 15;
/// frames of decoded peer audio buffered ahead per slot
const SLOT_RING_FRAMES: usize = 1 << 14;
/// discrete u/x events in flight
const EVENT_RING_DEPTH: usize = 256;

/// one param write goes two places: the u/x-visible store and the atomics
/// the audio callback actually reads
pub(crate) fn write_param(params: &ParamStore, controls: &MixerControls, id: ParamId, value: f32) {
    params.set(id, value);
    match id {
        ParamId::MasterVolume => controls.master_gain.store(clip_volume(value)),
        ParamId::MasterMute => controls.master_mute.store(value >= 0.5, Ordering::Relaxed),
        ParamId::MetronomeVolume => controls.click_gain.store(clip_volume(value)),
        ParamId::MetronomeMute => controls.click_mute.store(value >= 0.5, Ordering::Relaxed),
    }
}

struct ActiveSession {
    engine: Arc<Mutex<NinjamEngine>>,
    audio: AudioPath,
    worker: WorkerHandle,
    events: spsc::Consumer<UiEvent>,
}

pub struct NinjamPlugin {
    settings: SavedSettings,
    params: Arc<ParamStore>,
    controls: Arc<MixerControls>,
    snapshot: Arc<UiSnapshot>,
    shared: Arc<EngineShared>,
    license: Arc<LicenseSlot>,
    active: Option<ActiveSession>,
}

impl NinjamPlugin {
    pub fn new() -> NinjamPlugin {
        NinjamPlugin {
            settings: SavedSettings::default(),
            params: Arc::new(ParamStore::new()),
            controls: Arc::new(MixerControls::new()),
            snapshot: Arc::new(UiSnapshot::new()),
            shared: Arc::new(EngineShared::new()),
            license: Arc::new(LicenseSlot::new()),
            active: None,
        }
    }

    // --- lifecycle ---------------------------------------------------------

    /// host is starting processing: build the session plumbing and spawn the
    /// worker.  All audio-side buffers are sized here, never later.
    pub fn activate(&mut self, sample_rate: u32, max_block: usize) -> Result<(), BoxError> {
        if self.active.is_some() {
            simple_error::bail!("already active");
        }
        if sample_rate == 0 || max_block == 0 {
            simple_error::bail!("bad session parameters");
        }
        let session = Session {
            sample_rate,
            max_block,
        };
        let (events_tx, events_rx) = spsc::channel(EVENT_RING_DEPTH);
        let (xmit_tx, xmit_rx) = spsc::channel(XMIT_RING_FRAMES);
        let mut slot_txs = vec![];
        let mut slot_rxs = vec![];
        for _ in 0..MIXER_SLOTS {
            let (tx, rx) = spsc::channel(SLOT_RING_FRAMES);
            slot_txs.push(tx);
            slot_rxs.push(rx);
        }
        let engine = Arc::new(Mutex::new(NinjamEngine::new(
            session,
            self.shared.clone(),
            self.controls.clone(),
            self.snapshot.clone(),
            events_tx,
            xmit_rx,
            slot_txs,
            CodecKind::Fixed16,
            self.settings.local_channel.clone(),
        )));
        let audio = AudioPath::new(
            sample_rate,
            max_block,
            self.shared.clone(),
            self.controls.clone(),
            self.params.clone(),
            self.snapshot.clone(),
            xmit_tx,
            slot_rxs,
        );
        self.apply_settings_to_params();
        let worker = worker::spawn(engine.clone(), self.shared.clone(), self.license.clone());
        self.active = Some(ActiveSession {
            engine,
            audio,
            worker,
            events: events_rx,
        });
        info!("activated at {} Hz, {} frame blocks", sample_rate, max_block);
        Ok(())
    }

    /// host is stopping processing: tear the session down and join the
    /// worker.  Sample-rate changes come through here as a fresh activate.
    pub fn deactivate(&mut self) -> () {
        if let Some(mut session) = self.active.take() {
            session.worker.stop_and_join();
            self.snapshot.clear();
            info!("deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    // --- audio -------------------------------------------------------------

    /// The host's process call, with optional buffers the way raw plugin
    /// APIs deliver them.  A missing buffer is the host's problem to see.
    pub fn process(
        &mut self,
        in_a: Option<&[f32]>,
        in_b: Option<&[f32]>,
        out_a: Option<&mut [f32]>,
        out_b: Option<&mut [f32]>,
        transport: &Transport,
        events: &[ParamEvent],
    ) -> ProcessStatus {
        let session = match self.active.as_mut() {
            Some(s) => s,
            None => return ProcessStatus::Error,
        };
        match (in_a, in_b, out_a, out_b) {
            (Some(ia), Some(ib), Some(oa), Some(ob)) => {
                session.audio.process(ia, ib, oa, ob, transport, events)
            }
            _ => ProcessStatus::Error,
        }
    }

    // --- u/x imperative surface -------------------------------------------

    /// connect to `host:port`.  The password goes to the engine and nowhere
    /// else; server and username are remembered for the next session.
    pub fn connect(&mut self, server: &str, username: &str, password: &str) -> Result<(), BoxError> {
        self.settings.server = String::from(server);
        self.settings.username = String::from(username);
        match self.active.as_ref() {
            Some(session) => session
                .engine
                .lock()
                .unwrap()
                .connect(server, username, password),
            None => simple_error::bail!("not active"),
        }
    }

    pub fn disconnect(&mut self) -> () {
        if let Some(session) = self.active.as_ref() {
            session.engine.lock().unwrap().disconnect();
        }
    }

    pub fn set_local_channel_info(&mut self, name: &str, transmit: bool, bitrate: u32) -> () {
        self.settings.local_channel.name = String::from(name);
        self.settings.local_channel.transmit = transmit;
        self.settings.local_channel.bitrate = bitrate;
        if let Some(session) = self.active.as_ref() {
            session
                .engine
                .lock()
                .unwrap()
                .set_local_channel_info(name, transmit, bitrate);
        }
    }

    pub fn set_local_channel(&mut self, change: ChannelChange) -> () {
        if let Some(session) = self.active.as_ref() {
            session.engine.lock().unwrap().set_local_channel(change);
        }
    }

    pub fn set_peer_channel(
        &mut self,
        user: usize,
        channel_index: u8,
        change: ChannelChange,
    ) -> Result<(), SessionError> {
        match self.active.as_ref() {
            Some(session) => session
                .engine
                .lock()
                .unwrap()
                .set_peer_channel(user, channel_index, change),
            None => Ok(()),
        }
    }

    /// host or u/x parameter write; lands in both the param store and the
    /// audio-read atomics, and sticks in the persisted settings
    pub fn set_param(&mut self, index: u32, value: f32) -> bool {
        let id = match num::FromPrimitive::from_u32(index) {
            Some(id) => id,
            None => return false,
        };
        write_param(&self.params, &self.controls, id, value);
        match id {
            ParamId::MasterVolume => self.settings.master.volume = clip_volume(value),
            ParamId::MasterMute => self.settings.master.mute = value >= 0.5,
            ParamId::MetronomeVolume => self.settings.metronome.volume = clip_volume(value),
            ParamId::MetronomeMute => self.settings.metronome.mute = value >= 0.5,
        }
        true
    }

    pub fn param(&self, id: ParamId) -> f32 {
        self.params.get(id)
    }

    // --- u/x read surface --------------------------------------------------

    /// drain pending worker events in FIFO order
    pub fn drain_events<F: FnMut(UiEvent)>(&mut self, visitor: F) -> usize {
        match self.active.as_mut() {
            Some(session) => session.events.drain(visitor),
            None => 0,
        }
    }

    /// the always-valid sampling surface for meters and transport
    pub fn ui_snapshot(&self) -> Arc<UiSnapshot> {
        self.snapshot.clone()
    }

    /// current connection state tag (same values the mirror atomic uses)
    pub fn connection_state(&self) -> u8 {
        self.shared.state.load(Ordering::Acquire)
    }

    pub fn license_text(&self) -> Option<String> {
        self.license.pending_text()
    }

    pub fn license_respond(&self, accept: bool) -> () {
        self.license.respond(accept);
    }

    /// cloned peer tree for the u/x; refresh when UserInfoChanged arrives
    pub fn peers(&self) -> Vec<PeerUser> {
        match self.active.as_ref() {
            Some(session) => session.engine.lock().unwrap().peers_snapshot(),
            None => vec![],
        }
    }

    // --- persisted state ---------------------------------------------------

    /// serialize the settings document for the host's state chunk.  Live
    /// engine fields are snapshotted under the mutex; the write itself runs
    /// outside any lock and loops on short writes.
    pub fn save_state(&mut self) -> Result<String, BoxError> {
        let mut chunk = Vec::new();
        self.save_state_to(&mut chunk)?;
        Ok(String::from_utf8(chunk)?)
    }

    /// same document straight into a host-provided sink
    pub fn save_state_to(&mut self, sink: &mut dyn std::io::Write) -> Result<(), BoxError> {
        let live = self
            .active
            .as_ref()
            .map(|session| session.engine.lock().unwrap().local_channel_info());
        if let Some((name, transmit, bitrate)) = live {
            self.settings.local_channel.name = name;
            self.settings.local_channel.transmit = transmit;
            self.settings.local_channel.bitrate = bitrate;
        }
        self.settings.write_to(sink)
    }

    /// restore a settings document saved by this or an older version
    pub fn load_state(&mut self, data: &str) -> Result<(), BoxError> {
        let settings = SavedSettings::from_json(data)?;
        self.settings = settings;
        self.apply_settings_to_params();
        if let Some(session) = self.active.as_ref() {
            session.engine.lock().unwrap().set_local_channel_info(
                &self.settings.local_channel.name,
                self.settings.local_channel.transmit,
                self.settings.local_channel.bitrate,
            );
        }
        Ok(())
    }

    pub fn settings(&self) -> &SavedSettings {
        &self.settings
    }

    fn apply_settings_to_params(&self) -> () {
        write_param(
            &self.params,
            &self.controls,
            ParamId::MasterVolume,
            self.settings.master.volume,
        );
        write_param(
            &self.params,
            &self.controls,
            ParamId::MasterMute,
            if self.settings.master.mute { 1.0 } else { 0.0 },
        );
        write_param(
            &self.params,
            &self.controls,
            ParamId::MetronomeVolume,
            self.settings.metronome.volume,
        );
        write_param(
            &self.params,
            &self.controls,
            ParamId::MetronomeMute,
            if self.settings.metronome.mute { 1.0 } else { 0.0 },
        );
    }
}

impl Drop for NinjamPlugin {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl Default for NinjamPlugin {
    fn default() -> NinjamPlugin {
        NinjamPlugin::new()
    }
}
