//! the protocol engine.
//!
//! One instance per plugin, driven by the worker thread's `run()` ticks and
//! poked by the u/x through short mutex-held calls.  Each tick reads at most
//! one wire message, advances the encode and decode streams, and returns.
//! The audio callback never touches this struct; it talks to the engine
//! through [`EngineShared`], the mixer controls, and the PCM rings.
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::common::box_error::BoxError;
use crate::common::settings::LocalChannelSettings;
use crate::common::spsc;
use crate::common::timer::MicroTimer;
use crate::plugin::license::LicenseDecision;
use crate::plugin::snapshot::UiSnapshot;
use crate::sound::mixer::{solo_bit_for_slot, MixerControls, MIXER_SLOTS, SOLO_BIT_LOCAL};

use super::codec::{make_codec, CodecKind};
use super::connection::{password_hash, Connection};
use super::interval::{IntervalUploader, SlotKey, SlotPipe};
use super::peers::{PeerRegistry, PeerUser};
use super::wire::{
    keepalive_from_caps, pan_to_wire, volume_to_wire, ChannelInfo, ClientMessage, ServerMessage,
    CAPS_LICENSE_AGREED, CHANNEL_FLAG_TRANSMIT, PROTOCOL_VERSION,
};
use super::{
    ConnectionState, ServerParams, Session, SessionError, Tick, UiEvent, STATE_IDLE,
};

/// how many frames the engine pulls off the audio ring per gulp
const XMIT_GULP: usize = 4096;

/// atomics the audio callback shares with the engine
pub struct EngineShared {
    /// [`ConnectionState`] tag mirror, release/acquire
    pub state: AtomicU8,
    /// interval clock position, audio written
    pub interval_pos: AtomicU32,
    /// current interval length in frames
    pub interval_len: AtomicU32,
    /// length to adopt at the next boundary
    pub next_interval_len: AtomicU32,
    pub bpi: AtomicU32,
}

impl EngineShared {
    pub fn new() -> EngineShared {
        EngineShared {
            state: AtomicU8::new(STATE_IDLE),
            interval_pos: AtomicU32::new(0),
            interval_len: AtomicU32::new(0),
            next_interval_len: AtomicU32::new(0),
            bpi: AtomicU32::new(0),
        }
    }
    pub fn reset_clock(&self) -> () {
        self.interval_pos.store(0, Ordering::Relaxed);
        self.interval_len.store(0, Ordering::Relaxed);
        self.next_interval_len.store(0, Ordering::Relaxed);
        self.bpi.store(0, Ordering::Relaxed);
    }
}

/// u/x edits to a channel, local or peer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelChange {
    Subscribe(bool),
    Volume(f32),
    Pan(f32),
    Mute(bool),
    Solo(bool),
}

struct ConnectRequest {
    server: String,
    user: String,
    pass: String,
}

struct AuthContext {
    user: String,
    pass: String,
    challenge: [u8; 8],
    license: Option<String>,
}

struct LocalChannel {
    name: String,
    transmit: bool,
    bitrate: u32,
    solo: bool,
}

pub struct NinjamEngine {
    session: Session,
    state: ConnectionState,
    shared: Arc<EngineShared>,
    controls: Arc<MixerControls>,
    snapshot: Arc<UiSnapshot>,
    events: spsc::Producer<UiEvent>,
    conn: Option<Connection>,
    connect_req: Option<ConnectRequest>,
    pending_server: Option<String>,
    disconnect_req: bool,
    auth: Option<AuthContext>,
    license_decision: Option<LicenseDecision>,
    server: ServerParams,
    local: LocalChannel,
    last_sent_info: Option<ChannelInfo>,
    peers: PeerRegistry,
    uploader: IntervalUploader,
    slots: Vec<SlotPipe>,
    guid_routes: HashMap<[u8; 16], usize>,
    xmit_rx: spsc::Consumer<[f32; 2]>,
    xmit_buf: Vec<[f32; 2]>,
    out_msgs: Vec<ClientMessage>,
    ka_send: MicroTimer,
    ka_recv: MicroTimer,
    last_pos: u32,
    now: u128,
}

impl NinjamEngine {
    pub fn new(
        session: Session,
        shared: Arc<EngineShared>,
        controls: Arc<MixerControls>,
        snapshot: Arc<UiSnapshot>,
        events: spsc::Producer<UiEvent>,
        xmit_rx: spsc::Consumer<[f32; 2]>,
        slot_txs: Vec<spsc::Producer<[f32; 2]>>,
        codec: CodecKind,
        local: LocalChannelSettings,
    ) -> NinjamEngine {
        let mut slots = vec![];
        for tx in slot_txs {
            slots.push(SlotPipe::new(make_codec(codec, local.bitrate), tx));
        }
        NinjamEngine {
            session,
            state: ConnectionState::Idle,
            shared,
            controls,
            snapshot,
            events,
            conn: None,
            connect_req: None,
            pending_server: None,
            disconnect_req: false,
            auth: None,
            license_decision: None,
            server: ServerParams {
                bpm: 0.0,
                bpi: 0,
                keepalive_secs: 10,
            },
            local: LocalChannel {
                name: local.name,
                transmit: local.transmit,
                bitrate: local.bitrate,
                solo: false,
            },
            last_sent_info: None,
            peers: PeerRegistry::new(),
            uploader: IntervalUploader::new(make_codec(codec, local.bitrate)),
            slots,
            guid_routes: HashMap::new(),
            xmit_rx,
            xmit_buf: vec![[0.0, 0.0]; XMIT_GULP],
            out_msgs: vec![],
            ka_send: MicroTimer::new(0, 5_000_000),
            ka_recv: MicroTimer::new(0, 30_000_000),
            last_pos: 0,
            now: 0,
        }
    }

    // --- u/x entry points (mutex held briefly) -----------------------------

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn server_params(&self) -> ServerParams {
        self.server
    }

    /// queue a connect; the worker picks it up on its next tick
    pub fn connect(&mut self, server: &str, user: &str, pass: &str) -> Result<(), BoxError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Failed(_) => {
                self.connect_req = Some(ConnectRequest {
                    server: String::from(server),
                    user: String::from(user),
                    pass: String::from(pass),
                });
                Ok(())
            }
            _ => simple_error::bail!("already connected or connecting"),
        }
    }

    pub fn disconnect(&mut self) -> () {
        self.disconnect_req = true;
    }

    /// idempotent local channel config; only changed fields reach the wire
    pub fn set_local_channel_info(&mut self, name: &str, transmit: bool, bitrate: u32) -> () {
        self.local.name = String::from(name);
        self.local.transmit = transmit;
        self.local.bitrate = bitrate;
        if self.state == ConnectionState::Joined {
            self.send_local_info_if_changed();
        }
    }

    pub fn local_channel_info(&self) -> (String, bool, u32) {
        (self.local.name.clone(), self.local.transmit, self.local.bitrate)
    }

    /// monitor edits to the one local channel
    pub fn set_local_channel(&mut self, change: ChannelChange) -> () {
        match change {
            ChannelChange::Volume(v) => self.controls.local_gain.store(v),
            ChannelChange::Pan(p) => self.controls.local_pan.store(p),
            ChannelChange::Mute(m) => self.controls.local_mute.store(m, Ordering::Relaxed),
            ChannelChange::Solo(s) => {
                self.local.solo = s;
                self.rebuild_solo_mask();
            }
            ChannelChange::Subscribe(_) => {} // meaningless for the local channel
        }
    }

    /// edit one peer channel; registry first, wire messages as needed
    pub fn set_peer_channel(
        &mut self,
        user: usize,
        channel_index: u8,
        change: ChannelChange,
    ) -> Result<(), SessionError> {
        match change {
            ChannelChange::Subscribe(want) => {
                let has_slot = match self.peers.channel(user, channel_index) {
                    Some(c) => c.slot,
                    None => return Ok(()), // unknown channel; nothing to do
                };
                if want && has_slot.is_none() {
                    let slot = match self.find_free_slot() {
                        Some(s) => s,
                        None => {
                            if let Some(c) = self.peers.channel_mut(user, channel_index) {
                                c.subscribed = false;
                            }
                            self.notice("peer channel capacity exceeded");
                            return Err(SessionError::CapacityExceeded);
                        }
                    };
                    let user_name = self.peers.users()[user].name.clone();
                    self.slots[slot].assign(SlotKey {
                        user: user_name,
                        channel_index,
                    });
                    if let Some(c) = self.peers.channel_mut(user, channel_index) {
                        c.subscribed = true;
                        c.slot = Some(slot);
                        self.controls.slot_gain[slot].store(c.volume);
                        self.controls.slot_pan[slot].store(c.pan);
                        self.controls.set_slot_mute(slot, c.mute);
                    }
                } else if !want {
                    if let Some(slot) = has_slot {
                        self.release_slot(slot);
                    }
                    if let Some(c) = self.peers.channel_mut(user, channel_index) {
                        c.subscribed = false;
                        c.slot = None;
                    }
                }
                self.rebuild_solo_mask();
                if self.state == ConnectionState::Joined {
                    self.queue_usermask(user);
                    self.flush_messages();
                }
            }
            ChannelChange::Volume(v) => {
                if let Some(c) = self.peers.channel_mut(user, channel_index) {
                    c.volume = v;
                    if let Some(slot) = c.slot {
                        self.controls.slot_gain[slot].store(v);
                    }
                }
            }
            ChannelChange::Pan(p) => {
                if let Some(c) = self.peers.channel_mut(user, channel_index) {
                    c.pan = p;
                    if let Some(slot) = c.slot {
                        self.controls.slot_pan[slot].store(p);
                    }
                }
            }
            ChannelChange::Mute(m) => {
                if let Some(c) = self.peers.channel_mut(user, channel_index) {
                    c.mute = m;
                    if let Some(slot) = c.slot {
                        self.controls.set_slot_mute(slot, m);
                    }
                }
            }
            ChannelChange::Solo(s) => {
                if let Some(c) = self.peers.channel_mut(user, channel_index) {
                    c.solo = s;
                }
                self.rebuild_solo_mask();
            }
        }
        Ok(())
    }

    pub fn peer_channel(&self, user: usize, channel_index: u8) -> Option<super::peers::PeerChannel> {
        self.peers.channel(user, channel_index).cloned()
    }

    pub fn peers_dirty(&self) -> bool {
        self.peers.is_dirty()
    }

    /// clone of the peer tree for the u/x, clearing the dirty flag
    pub fn peers_snapshot(&mut self) -> Vec<PeerUser> {
        self.peers.snapshot()
    }

    /// worker reports the license rendezvous outcome here
    pub fn set_license_response(&mut self, decision: LicenseDecision) -> () {
        self.license_decision = Some(decision);
    }

    /// worker is exiting; tear the session down quietly
    pub fn shutdown(&mut self) -> () {
        if self.conn.is_some() {
            self.begin_disconnect();
            self.finish_disconnect();
        }
    }

    // --- the tick ----------------------------------------------------------

    /// One cooperative step: consume a pending request, read at most one
    /// message, move the interval streams along.
    pub fn run(&mut self, now: u128) -> Result<Tick, SessionError> {
        self.now = now;
        if self.disconnect_req {
            self.disconnect_req = false;
            if self.conn.is_some() {
                self.begin_disconnect();
                self.finish_disconnect();
                return Ok(Tick::Progressed);
            }
            // connect still in flight; abandon it
            if !matches!(
                self.state,
                ConnectionState::Idle | ConnectionState::Failed(_)
            ) {
                self.pending_server = None;
                self.finish_disconnect();
                return Ok(Tick::Progressed);
            }
        }
        match self.state {
            ConnectionState::Idle | ConnectionState::Failed(_) => {
                if let Some(req) = self.connect_req.take() {
                    self.start_connect(req);
                    return Ok(Tick::Progressed);
                }
                Ok(Tick::Idle)
            }
            ConnectionState::Resolving => self.tick_resolve(),
            ConnectionState::Disconnecting => {
                self.finish_disconnect();
                Ok(Tick::Progressed)
            }
            _ => self.tick_connected(),
        }
    }

    fn start_connect(&mut self, req: ConnectRequest) -> () {
        info!("connecting to {}", req.server);
        self.auth = Some(AuthContext {
            user: req.user,
            pass: req.pass,
            challenge: [0; 8],
            license: None,
        });
        self.pending_server = Some(req.server);
        self.set_state(ConnectionState::Resolving);
    }

    fn tick_resolve(&mut self) -> Result<Tick, SessionError> {
        let server = match self.pending_server.take() {
            Some(server) => server,
            None => {
                return Err(self.fail(SessionError::ProtocolError("resolve without request")))
            }
        };
        match Connection::open(&server) {
            Ok(conn) => {
                self.conn = Some(conn);
                self.set_state(ConnectionState::Handshaking);
                Ok(Tick::Progressed)
            }
            Err(e) => {
                warn!("connect to {} failed: {}", server, e);
                Err(self.fail(SessionError::ResolveFailed))
            }
        }
    }

    fn tick_connected(&mut self) -> Result<Tick, SessionError> {
        // a license answer may be waiting from the rendezvous
        if self.state == ConnectionState::AwaitingLicense {
            if let Some(decision) = self.license_decision.take() {
                return self.apply_license_decision(decision);
            }
        }

        let polled = match self.conn.as_mut() {
            Some(conn) => conn.poll_message(),
            None => return Err(self.fail(SessionError::ProtocolError("no stream"))),
        };
        let mut progressed = false;
        let mut license_prompt = None;
        match polled {
            Ok(Some(msg)) => {
                self.ka_recv.reset(self.now);
                progressed = true;
                license_prompt = self.dispatch(msg)?;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("socket read: {}", e);
                return Err(self.fail(SessionError::NetworkDropped));
            }
        }

        if self.state == ConnectionState::Joined {
            if self.advance_streams() {
                progressed = true;
            }
            self.check_keepalive()?;
        }
        self.flush_messages();
        self.publish_snapshot();

        match license_prompt {
            Some(text) => Ok(Tick::License(text)),
            None if progressed => Ok(Tick::Progressed),
            None => Ok(Tick::Idle),
        }
    }

    /// handle one message; returns license text when the u/x must be asked
    fn dispatch(&mut self, msg: ServerMessage) -> Result<Option<String>, SessionError> {
        match msg {
            ServerMessage::AuthChallenge {
                challenge,
                server_caps,
                protocol_version: _,
                license,
            } => {
                if self.state != ConnectionState::Handshaking {
                    return Err(self.fail(SessionError::ProtocolError("unexpected challenge")));
                }
                self.server.keepalive_secs = keepalive_from_caps(server_caps);
                let (user, agreed) = match self.auth.as_mut() {
                    Some(auth) => {
                        auth.challenge = challenge;
                        auth.license = license;
                        (auth.user.clone(), auth.license.is_none())
                    }
                    None => {
                        return Err(self.fail(SessionError::ProtocolError("challenge without auth")))
                    }
                };
                self.queue_auth(&user, agreed);
                self.set_state(ConnectionState::Authenticating);
                Ok(None)
            }
            ServerMessage::AuthReply {
                success,
                message,
                max_channels: _,
            } => {
                if self.state == ConnectionState::Joined {
                    // reply to the license acknowledgement; already in
                    debug!("auth reply after join, ignoring");
                    return Ok(None);
                }
                if self.state != ConnectionState::Authenticating {
                    return Err(self.fail(SessionError::ProtocolError("unexpected auth reply")));
                }
                if !success {
                    return Err(self.fail(SessionError::AuthFailed(message)));
                }
                let license = self.auth.as_mut().and_then(|a| a.license.take());
                match license {
                    Some(text) => {
                        self.set_state(ConnectionState::AwaitingLicense);
                        Ok(Some(text))
                    }
                    None => {
                        self.enter_joined();
                        Ok(None)
                    }
                }
            }
            ServerMessage::ConfigChange { bpm, bpi } => {
                self.server.bpm = bpm as f32;
                self.server.bpi = bpi as u32;
                let frames = self.server.interval_frames(self.session.sample_rate);
                self.shared.bpi.store(self.server.bpi, Ordering::Relaxed);
                self.shared
                    .next_interval_len
                    .store(frames, Ordering::Relaxed);
                if self.shared.interval_len.load(Ordering::Relaxed) == 0 {
                    // first tempo of the session takes effect immediately
                    self.shared.interval_len.store(frames, Ordering::Relaxed);
                }
                if self.state == ConnectionState::Joined && self.uploader.is_idle() {
                    self.uploader.start_session(frames);
                }
                info!("room config: {} bpm, {} bpi ({} frames)", bpm, bpi, frames);
                Ok(None)
            }
            ServerMessage::UserInfoChange { entries } => {
                self.peers.apply_userinfo(&entries);
                self.reconcile_slots();
                self.emit(UiEvent::UserInfoChanged);
                Ok(None)
            }
            ServerMessage::IntervalBegin {
                guid,
                estimated_size,
                fourcc,
                channel_index,
                user,
            } => {
                self.route_interval_begin(guid, estimated_size, fourcc, channel_index, &user);
                Ok(None)
            }
            ServerMessage::IntervalWrite {
                guid,
                flags,
                payload,
            } => {
                self.route_interval_write(guid, flags, &payload);
                Ok(None)
            }
            ServerMessage::Chat { parts } => {
                self.handle_chat(parts);
                Ok(None)
            }
            ServerMessage::KeepAlive => Ok(None),
        }
    }

    fn apply_license_decision(&mut self, decision: LicenseDecision) -> Result<Tick, SessionError> {
        match decision {
            LicenseDecision::Accept => {
                // acknowledgement: re-auth with the agreed bit set
                let user = match self.auth.as_ref() {
                    Some(a) => a.user.clone(),
                    None => {
                        return Err(self.fail(SessionError::ProtocolError("license without auth")))
                    }
                };
                self.queue_auth(&user, true);
                self.enter_joined();
                self.flush_messages();
                Ok(Tick::Progressed)
            }
            LicenseDecision::Reject => Err(self.fail(SessionError::LicenseRejected)),
            LicenseDecision::Timeout => Err(self.fail(SessionError::LicenseTimeout)),
        }
    }

    fn queue_auth(&mut self, user: &str, agreed: bool) -> () {
        let auth = match self.auth.as_ref() {
            Some(a) => a,
            None => return,
        };
        let caps = if agreed { CAPS_LICENSE_AGREED } else { 0 };
        self.out_msgs.push(ClientMessage::AuthUser {
            passhash: password_hash(user, &auth.pass, &auth.challenge),
            username: String::from(user),
            caps,
            protocol_version: PROTOCOL_VERSION,
        });
    }

    fn enter_joined(&mut self) -> () {
        self.set_state(ConnectionState::Joined);
        // anything still in the audio ring belongs to a previous session
        while self.xmit_rx.pop_slice(&mut self.xmit_buf) == self.xmit_buf.len() {}
        let frames = self.server.interval_frames(self.session.sample_rate);
        self.uploader.start_session(frames);
        self.last_sent_info = None;
        self.send_local_info_if_changed();
        self.ka_send
            .set_interval(self.server.keepalive_secs as u128 * 1_000_000 / 2);
        self.ka_recv
            .set_interval(self.server.keepalive_secs as u128 * 3_000_000);
        self.ka_send.reset(self.now);
        self.ka_recv.reset(self.now);
        self.last_pos = 0;
        info!("joined the room");
    }

    // --- steady state ------------------------------------------------------

    fn advance_streams(&mut self) -> bool {
        let mut progressed = false;
        // pull whatever the audio callback produced and feed the encoder
        let next_len = self.shared.next_interval_len.load(Ordering::Relaxed);
        loop {
            let n = self.xmit_rx.pop_slice(&mut self.xmit_buf);
            if n == 0 {
                break;
            }
            progressed = true;
            let transmit = self.local.transmit;
            self.uploader
                .feed(&self.xmit_buf[..n], next_len, transmit, &mut self.out_msgs);
            if n < self.xmit_buf.len() {
                break;
            }
        }

        // boundary detection off the audio-advanced clock
        let pos = self.shared.interval_pos.load(Ordering::Relaxed);
        let boundary = pos < self.last_pos;
        self.last_pos = pos;

        for slot in 0..self.slots.len() {
            self.slots[slot].pump(boundary);
        }
        // refresh per-channel meters for the u/x copy
        for slot in 0..self.slots.len() {
            if let Some(key) = self.slots[slot].assigned().cloned() {
                let peak = self.slots[slot].peak();
                self.peers
                    .set_channel_peak(&key.user, key.channel_index, peak);
            }
        }
        progressed
    }

    fn check_keepalive(&mut self) -> Result<(), SessionError> {
        if self.ka_recv.expired(self.now) {
            warn!("server went silent");
            return Err(self.fail(SessionError::NetworkDropped));
        }
        if self.ka_send.expired(self.now) {
            self.out_msgs.push(ClientMessage::KeepAlive);
        }
        Ok(())
    }

    fn route_interval_begin(
        &mut self,
        guid: [u8; 16],
        estimated_size: u32,
        fourcc: [u8; 4],
        channel_index: u8,
        user: &str,
    ) -> () {
        let slot = match self.slot_for(user, channel_index) {
            Some(s) => s,
            None => return, // not subscribed, or over capacity
        };
        self.guid_routes.retain(|_, s| *s != slot);
        match self.slots[slot].begin_interval(guid, estimated_size, fourcc) {
            Ok(()) => {
                if fourcc != [0; 4] {
                    self.guid_routes.insert(guid, slot);
                }
            }
            Err(e) => {
                warn!("codec refused stream from {}: {}", user, e);
                self.notice("codec refused a peer stream");
            }
        }
    }

    fn route_interval_write(&mut self, guid: [u8; 16], flags: u8, payload: &[u8]) -> () {
        let slot = match self.guid_routes.get(&guid) {
            Some(s) => *s,
            None => return, // stale guid, sender moved on
        };
        match self.slots[slot].write_chunk(guid, flags, payload) {
            Ok(true) => {
                self.guid_routes.remove(&guid);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("decode error, dropping interval: {}", e);
                self.notice("codec refused a peer interval");
                self.slots[slot].abort_current();
                self.guid_routes.remove(&guid);
            }
        }
    }

    fn handle_chat(&mut self, parts: Vec<String>) -> () {
        match parts.first().map(String::as_str) {
            Some("TOPIC") => {
                if let Some(topic) = parts.get(2) {
                    self.emit(UiEvent::TopicChanged(topic.clone()));
                }
            }
            Some("MSG") => {
                // chat is parsed but carries no surface in this client
                let event = UiEvent::Chat {
                    from: parts.get(1).cloned().unwrap_or_default(),
                    text: parts.get(2).cloned().unwrap_or_default(),
                };
                debug!("dropping chat: {:?}", event);
            }
            _ => {}
        }
    }

    // --- slots -------------------------------------------------------------

    fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_free())
    }

    fn slot_for(&self, user: &str, channel_index: u8) -> Option<usize> {
        self.slots.iter().position(|s| match s.assigned() {
            Some(key) => key.user == user && key.channel_index == channel_index,
            None => false,
        })
    }

    fn release_slot(&mut self, slot: usize) -> () {
        self.slots[slot].release();
        self.guid_routes.retain(|_, s| *s != slot);
        self.controls.slot_gain[slot].store(1.0);
        self.controls.slot_pan[slot].store(0.0);
        self.controls.set_slot_mute(slot, false);
    }

    /// bring slot assignments in line with the registry after a userinfo
    fn reconcile_slots(&mut self) -> () {
        // drop slots whose channel went away
        for slot in 0..self.slots.len() {
            let stale = match self.slots[slot].assigned() {
                Some(key) => {
                    let uidx = self.peers.find_user(&key.user);
                    match uidx {
                        Some(u) => match self.peers.channel(u, key.channel_index) {
                            Some(c) => !c.subscribed,
                            None => true,
                        },
                        None => true,
                    }
                }
                None => false,
            };
            if stale {
                self.release_slot(slot);
            }
        }
        // give new subscribed channels a slot, in registry order
        let mut capacity_hit = false;
        let mut masks_dirty = vec![];
        for uidx in 0..self.peers.users().len() {
            let channel_indices: Vec<u8> = self.peers.users()[uidx]
                .channels
                .iter()
                .map(|c| c.channel_index)
                .collect();
            for ch in channel_indices {
                let needs_slot = self
                    .peers
                    .channel(uidx, ch)
                    .map(|c| c.subscribed && c.slot.is_none())
                    .unwrap_or(false);
                if !needs_slot {
                    continue;
                }
                match self.find_free_slot() {
                    Some(slot) => {
                        let user_name = self.peers.users()[uidx].name.clone();
                        self.slots[slot].assign(SlotKey {
                            user: user_name,
                            channel_index: ch,
                        });
                        if let Some(c) = self.peers.channel_mut(uidx, ch) {
                            c.slot = Some(slot);
                            self.controls.slot_gain[slot].store(c.volume);
                            self.controls.slot_pan[slot].store(c.pan);
                            self.controls.set_slot_mute(slot, c.mute);
                        }
                        if !masks_dirty.contains(&uidx) {
                            masks_dirty.push(uidx);
                        }
                    }
                    None => {
                        if let Some(c) = self.peers.channel_mut(uidx, ch) {
                            c.subscribed = false;
                        }
                        capacity_hit = true;
                    }
                }
            }
        }
        if capacity_hit {
            warn!("more peer channels than slots, leaving extras unsubscribed");
            self.notice("peer channel capacity exceeded");
        }
        if self.state == ConnectionState::Joined {
            for uidx in masks_dirty {
                self.queue_usermask(uidx);
            }
        }
        self.rebuild_solo_mask();
    }

    fn rebuild_solo_mask(&mut self) -> () {
        let mut mask = 0u32;
        if self.local.solo {
            mask |= SOLO_BIT_LOCAL;
        }
        for u in self.peers.users() {
            for c in &u.channels {
                if c.solo {
                    if let Some(slot) = c.slot {
                        mask |= solo_bit_for_slot(slot);
                    }
                }
            }
        }
        self.controls.solo_mask.store(mask, Ordering::Relaxed);
    }

    // --- wire out ----------------------------------------------------------

    fn build_local_info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.local.name.clone(),
            volume: volume_to_wire(1.0),
            pan: pan_to_wire(0.0),
            flags: if self.local.transmit {
                CHANNEL_FLAG_TRANSMIT
            } else {
                0
            },
        }
    }

    fn send_local_info_if_changed(&mut self) -> () {
        let info = self.build_local_info();
        if self.last_sent_info.as_ref() == Some(&info) {
            return;
        }
        self.out_msgs.push(ClientMessage::SetChannelInfo {
            channels: vec![info.clone()],
        });
        self.last_sent_info = Some(info);
        self.flush_messages();
    }

    fn queue_usermask(&mut self, user: usize) -> () {
        let name = match self.peers.users().get(user) {
            Some(u) => u.name.clone(),
            None => return,
        };
        let mask = self.peers.user_mask(user);
        self.out_msgs
            .push(ClientMessage::SetUserMask {
                entries: vec![(name, mask)],
            });
    }

    fn flush_messages(&mut self) -> () {
        if self.out_msgs.is_empty() {
            return;
        }
        let msgs = std::mem::take(&mut self.out_msgs);
        let mut dead = false;
        if let Some(conn) = self.conn.as_mut() {
            for msg in &msgs {
                if let Err(e) = conn.send(msg) {
                    warn!("send failed: {}", e);
                    dead = true;
                    break;
                }
            }
        }
        if dead {
            self.fail(SessionError::NetworkDropped);
        } else if self.conn.is_some() {
            self.ka_send.reset(self.now);
        }
    }

    fn publish_snapshot(&self) -> () {
        self.snapshot.bpm.store(self.server.bpm);
        self.snapshot.bpi.store(self.server.bpi, Ordering::Relaxed);
        let pos = self.shared.interval_pos.load(Ordering::Relaxed);
        let len = self.shared.interval_len.load(Ordering::Relaxed);
        self.snapshot.interval_position.store(pos, Ordering::Relaxed);
        self.snapshot.interval_length.store(len, Ordering::Relaxed);
        let beat = if len > 0 {
            (pos as u64 * self.server.bpi as u64 / len as u64) as u32
        } else {
            0
        };
        self.snapshot.beat.store(beat, Ordering::Relaxed);
    }

    // --- teardown ----------------------------------------------------------

    fn begin_disconnect(&mut self) -> () {
        self.set_state(ConnectionState::Disconnecting);
        // drain the goodbye: finish the interval in flight, if any
        let mut msgs = vec![];
        self.uploader.stop_session(&mut msgs);
        self.out_msgs.append(&mut msgs);
        self.flush_messages();
    }

    fn finish_disconnect(&mut self) -> () {
        self.teardown_session();
        self.set_state(ConnectionState::Idle);
        info!("disconnected");
    }

    /// drop the connection and return the error for the caller to propagate.
    /// All the observable work (mirror store, event) happens here.
    fn fail(&mut self, err: SessionError) -> SessionError {
        warn!("session failed: {}", err);
        self.teardown_session();
        self.set_state_with_detail(
            ConnectionState::Failed(err.clone()),
            Some(err.to_string()),
        );
        err
    }

    fn teardown_session(&mut self) -> () {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.auth = None;
        self.license_decision = None;
        self.uploader.abort_session();
        self.out_msgs.clear();
        for slot in 0..self.slots.len() {
            self.release_slot(slot);
        }
        self.guid_routes.clear();
        if !self.peers.is_empty() {
            self.peers.clear();
            self.emit(UiEvent::UserInfoChanged);
        }
        self.server.bpm = 0.0;
        self.server.bpi = 0;
        self.last_sent_info = None;
        self.last_pos = 0;
        self.shared.reset_clock();
        self.snapshot.clear();
        self.controls.solo_mask.store(0, Ordering::Relaxed);
    }

    fn set_state(&mut self, state: ConnectionState) -> () {
        self.set_state_with_detail(state, None);
    }

    fn set_state_with_detail(&mut self, state: ConnectionState, detail: Option<String>) -> () {
        if self.state == state {
            return;
        }
        debug!("state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.shared.state.store(self.state.tag(), Ordering::Release);
        self.emit(UiEvent::StatusChanged(self.state.clone(), detail));
    }

    fn notice(&mut self, text: &str) -> () {
        self.emit(UiEvent::StatusChanged(
            self.state.clone(),
            Some(String::from(text)),
        ));
    }

    fn emit(&mut self, event: UiEvent) -> () {
        if let UiEvent::Chat { .. } = event {
            return; // chat carries no surface here
        }
        if !self.events.try_push(event) {
            debug!("u/x event queue full, dropping");
        }
    }
}

#[cfg(test)]
mod test_engine {
    use super::*;
    use crate::ninjam::wire::{FrameReader, MSG_CLIENT_AUTH_USER, MSG_CLIENT_SET_CHANNEL_INFO};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    struct Fixture {
        engine: NinjamEngine,
        events: spsc::Consumer<UiEvent>,
        _xmit_tx: spsc::Producer<[f32; 2]>,
        shared: Arc<EngineShared>,
    }

    fn build_engine() -> Fixture {
        let shared = Arc::new(EngineShared::new());
        let controls = Arc::new(MixerControls::new());
        let snapshot = Arc::new(UiSnapshot::new());
        let (events_tx, events_rx) = spsc::channel(64);
        let (xmit_tx, xmit_rx) = spsc::channel(1 << 14);
        let mut slot_txs = vec![];
        let mut slot_rxs = vec![];
        for _ in 0..MIXER_SLOTS {
            let (tx, rx) = spsc::channel(1 << 12);
            slot_txs.push(tx);
            slot_rxs.push(rx);
        }
        drop(slot_rxs);
        let engine = NinjamEngine::new(
            Session {
                sample_rate: 48_000,
                max_block: 512,
            },
            shared.clone(),
            controls,
            snapshot,
            events_tx,
            xmit_rx,
            slot_txs,
            CodecKind::Fixed16,
            LocalChannelSettings::default(),
        );
        Fixture {
            engine,
            events: events_rx,
            _xmit_tx: xmit_tx,
            shared,
        }
    }

    fn stub_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn server_handshake(
        listener: TcpListener,
        license: Option<&'static str>,
        accept_auth: bool,
    ) -> std::thread::JoinHandle<Vec<(u8, Vec<u8>)>> {
        std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            // challenge
            let mut payload = vec![8, 7, 6, 5, 4, 3, 2, 1];
            let caps: u32 = if license.is_some() {
                CAPS_LICENSE_AGREED | (5 << 8)
            } else {
                5 << 8
            };
            payload.extend_from_slice(&caps.to_le_bytes());
            payload.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
            if let Some(text) = license {
                payload.extend_from_slice(text.as_bytes());
                payload.push(0);
            }
            let mut frame = vec![0x00u8];
            frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            frame.extend_from_slice(&payload);
            sock.write_all(&frame).unwrap();

            // collect frames from the client for a while
            let mut framer = FrameReader::new();
            let mut collected = vec![];
            let mut replied = false;
            let mut scratch = [0u8; 4096];
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            while std::time::Instant::now() < deadline {
                match sock.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(n) => framer.push_bytes(&scratch[..n]),
                    Err(_) => {}
                }
                while let Some((t, p)) = framer.next_frame().unwrap() {
                    if t == MSG_CLIENT_AUTH_USER && !replied {
                        replied = true;
                        // auth reply
                        let mut rp = vec![if accept_auth { 1u8 } else { 0u8 }];
                        rp.extend_from_slice(b"bob\0");
                        rp.push(32);
                        let mut rf = vec![0x01u8];
                        rf.extend_from_slice(&(rp.len() as u32).to_le_bytes());
                        rf.extend_from_slice(&rp);
                        sock.write_all(&rf).unwrap();
                        if accept_auth {
                            // config change right after
                            let mut cp = vec![];
                            cp.extend_from_slice(&120u16.to_le_bytes());
                            cp.extend_from_slice(&16u16.to_le_bytes());
                            let mut cf = vec![0x02u8];
                            cf.extend_from_slice(&(cp.len() as u32).to_le_bytes());
                            cf.extend_from_slice(&cp);
                            sock.write_all(&cf).unwrap();
                        }
                    }
                    collected.push((t, p));
                }
                if collected.len() >= 3 && replied {
                    break;
                }
            }
            collected
        })
    }

    fn run_until<F: Fn(&NinjamEngine) -> bool>(fx: &mut Fixture, pred: F) -> bool {
        let mut now = crate::utils::get_micro_time();
        for _ in 0..400 {
            let _ = fx.engine.run(now);
            if pred(&fx.engine) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
            now += 5_000;
        }
        false
    }

    #[test]
    fn cold_connect_reaches_joined() {
        let (listener, addr) = stub_server();
        let server = server_handshake(listener, None, true);
        let mut fx = build_engine();
        fx.engine.connect(&addr, "bob", "pw").unwrap();
        assert!(run_until(&mut fx, |e| {
            *e.state() == ConnectionState::Joined
        }));
        // mirror agrees
        assert_eq!(
            fx.shared.state.load(Ordering::Acquire),
            crate::ninjam::STATE_JOINED
        );
        // one tick after the config notify, tempo is in
        assert!(run_until(&mut fx, |e| e.server_params().bpm > 0.0));
        assert_eq!(fx.engine.server_params().bpi, 16);

        // exactly one Joined status event, and the transitions are ordered
        let mut states = vec![];
        fx.events.drain(|ev| {
            if let UiEvent::StatusChanged(s, _) = ev {
                states.push(s.tag());
            }
        });
        let joined = states
            .iter()
            .filter(|t| **t == crate::ninjam::STATE_JOINED)
            .count();
        assert_eq!(joined, 1);
        let mut sorted = states.clone();
        sorted.sort();
        assert_eq!(states, sorted);

        fx.engine.disconnect();
        let now = crate::utils::get_micro_time();
        let _ = fx.engine.run(now);
        assert_eq!(*fx.engine.state(), ConnectionState::Idle);
        let _ = server.join();
    }

    #[test]
    fn license_accept_path() {
        let (listener, addr) = stub_server();
        let server = server_handshake(listener, Some("TERMS"), true);
        let mut fx = build_engine();
        fx.engine.connect(&addr, "bob", "pw").unwrap();

        // run until the engine hands back the license prompt
        let mut prompt = None;
        let mut now = crate::utils::get_micro_time();
        for _ in 0..400 {
            match fx.engine.run(now) {
                Ok(Tick::License(text)) => {
                    prompt = Some(text);
                    break;
                }
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(5));
            now += 5_000;
        }
        assert_eq!(prompt.as_deref(), Some("TERMS"));
        assert_eq!(*fx.engine.state(), ConnectionState::AwaitingLicense);

        fx.engine.set_license_response(LicenseDecision::Accept);
        assert!(run_until(&mut fx, |e| {
            *e.state() == ConnectionState::Joined
        }));
        let frames = server.join().unwrap();
        // the acknowledgement is a second auth with the agreed bit
        let auths: Vec<_> = frames
            .iter()
            .filter(|(t, _)| *t == MSG_CLIENT_AUTH_USER)
            .collect();
        assert_eq!(auths.len(), 2);
        let caps = u32::from_le_bytes(auths[1].1[24..28].try_into().unwrap());
        assert!(caps & CAPS_LICENSE_AGREED != 0);
    }

    #[test]
    fn license_reject_fails_the_session() {
        let (listener, addr) = stub_server();
        let server = server_handshake(listener, Some("TERMS"), true);
        let mut fx = build_engine();
        fx.engine.connect(&addr, "bob", "pw").unwrap();
        let mut now = crate::utils::get_micro_time();
        for _ in 0..400 {
            if let Ok(Tick::License(_)) = fx.engine.run(now) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
            now += 5_000;
        }
        fx.engine.set_license_response(LicenseDecision::Reject);
        let err = fx.engine.run(now + 1000);
        assert_eq!(err, Err(SessionError::LicenseRejected));
        assert_eq!(
            *fx.engine.state(),
            ConnectionState::Failed(SessionError::LicenseRejected)
        );
        let _ = server.join();
    }

    #[test]
    fn bad_credentials_fail_auth() {
        let (listener, addr) = stub_server();
        let server = server_handshake(listener, None, false);
        let mut fx = build_engine();
        fx.engine.connect(&addr, "bob", "wrong").unwrap();
        assert!(run_until(&mut fx, |e| matches!(
            e.state(),
            ConnectionState::Failed(SessionError::AuthFailed(_))
        )));
        let _ = server.join();
    }

    #[test]
    fn unreachable_server_fails_resolve() {
        let mut fx = build_engine();
        fx.engine.connect("127.0.0.1:1", "bob", "pw").unwrap();
        let now = crate::utils::get_micro_time();
        let _ = fx.engine.run(now); // pick up request
        let res = fx.engine.run(now + 1000); // resolve attempt
        assert_eq!(res, Err(SessionError::ResolveFailed));
        assert!(matches!(
            fx.engine.state(),
            ConnectionState::Failed(SessionError::ResolveFailed)
        ));
    }

    #[test]
    fn channel_info_is_diffed() {
        let (listener, addr) = stub_server();
        let server = server_handshake(listener, None, true);
        let mut fx = build_engine();
        fx.engine.connect(&addr, "bob", "pw").unwrap();
        assert!(run_until(&mut fx, |e| {
            *e.state() == ConnectionState::Joined
        }));
        // same info twice: no extra wire traffic
        fx.engine.set_local_channel_info("channel", true, 64);
        fx.engine.set_local_channel_info("channel", true, 64);
        // changed name: one more message
        fx.engine.set_local_channel_info("gtr", true, 64);
        // give the socket a moment, then disconnect so the server returns
        std::thread::sleep(Duration::from_millis(50));
        fx.engine.disconnect();
        let _ = fx.engine.run(crate::utils::get_micro_time());
        let frames = server.join().unwrap();
        let infos = frames
            .iter()
            .filter(|(t, _)| *t == MSG_CLIENT_SET_CHANNEL_INFO)
            .count();
        // one at join plus one for the rename
        assert_eq!(infos, 2);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut fx = build_engine();
        // fill the registry past the slot count
        let mut entries = vec![];
        for i in 0..(MIXER_SLOTS + 2) {
            entries.push(crate::ninjam::wire::UserInfoEntry {
                active: true,
                channel_index: 0,
                volume: 0,
                pan: 0,
                flags: CHANNEL_FLAG_TRANSMIT,
                user: format!("user{}", i),
                channel_name: String::from("ch"),
            });
        }
        fx.engine.peers.apply_userinfo(&entries);
        fx.engine.reconcile_slots();
        let assigned = fx.engine.slots.iter().filter(|s| !s.is_free()).count();
        assert_eq!(assigned, MIXER_SLOTS);
        // the overflow channels got unsubscribed instead of crashing
        let over = fx.engine.peers.find_user(&format!("user{}", MIXER_SLOTS)).unwrap();
        assert!(!fx.engine.peers.channel(over, 0).unwrap().subscribed);
        // and re-subscribing one of them reports the capacity error
        let res = fx
            .engine
            .set_peer_channel(over, 0, ChannelChange::Subscribe(true));
        assert_eq!(res, Err(SessionError::CapacityExceeded));
    }

    #[test]
    fn peer_channel_set_then_get() {
        let mut fx = build_engine();
        fx.engine.peers.apply_userinfo(&[crate::ninjam::wire::UserInfoEntry {
            active: true,
            channel_index: 3,
            volume: 0,
            pan: 0,
            flags: CHANNEL_FLAG_TRANSMIT,
            user: String::from("sue"),
            channel_name: String::from("keys"),
        }]);
        fx.engine.reconcile_slots();
        let uidx = fx.engine.peers.find_user("sue").unwrap();
        fx.engine
            .set_peer_channel(uidx, 3, ChannelChange::Volume(0.75))
            .unwrap();
        fx.engine
            .set_peer_channel(uidx, 3, ChannelChange::Pan(-0.5))
            .unwrap();
        fx.engine
            .set_peer_channel(uidx, 3, ChannelChange::Mute(true))
            .unwrap();
        let ch = fx.engine.peer_channel(uidx, 3).unwrap();
        assert_eq!(ch.volume, 0.75);
        assert_eq!(ch.pan, -0.5);
        assert!(ch.mute);
        // the slot atomics followed along
        let slot = ch.slot.unwrap();
        assert_eq!(fx.engine.controls.slot_gain[slot].load(), 0.75);
        assert_eq!(fx.engine.controls.slot_pan[slot].load(), -0.5);
    }

    #[test]
    fn solo_mask_tracks_channels() {
        let mut fx = build_engine();
        fx.engine.peers.apply_userinfo(&[crate::ninjam::wire::UserInfoEntry {
            active: true,
            channel_index: 0,
            volume: 0,
            pan: 0,
            flags: CHANNEL_FLAG_TRANSMIT,
            user: String::from("sue"),
            channel_name: String::from("keys"),
        }]);
        fx.engine.reconcile_slots();
        let uidx = fx.engine.peers.find_user("sue").unwrap();
        fx.engine
            .set_peer_channel(uidx, 0, ChannelChange::Solo(true))
            .unwrap();
        let slot = fx.engine.peer_channel(uidx, 0).unwrap().slot.unwrap();
        let mask = fx.engine.controls.solo_mask.load(Ordering::Relaxed);
        assert_eq!(mask, solo_bit_for_slot(slot));
        fx.engine.set_local_channel(ChannelChange::Solo(true));
        let mask = fx.engine.controls.solo_mask.load(Ordering::Relaxed);
        assert_eq!(mask, solo_bit_for_slot(slot) | SOLO_BIT_LOCAL);
    }
}
