//! interval streaming, both directions.
//!
//! The defining trick of the protocol: during interval N everyone uploads
//! what they are playing, and during N+1 everyone hears everyone else's N.
//! [`IntervalUploader`] chops the outgoing PCM stream into guid-tagged
//! intervals; [`SlotPipe`] reassembles incoming chunks per peer channel and
//! feeds the decoded audio toward the mixer, holding each finished interval
//! until the next boundary of the shared clock.
use log::{debug, warn};
use std::collections::VecDeque;

use crate::common::box_error::BoxError;
use crate::common::spsc;

use super::codec::{codec_for_fourcc, BlockCodec};
use super::wire::{ClientMessage, INTERVAL_FLAG_LAST};

/// fresh random identifier for a local interval
pub fn new_guid() -> [u8; 16] {
    rand::random()
}

/// flush encoded bytes once this much is pending
const UPLOAD_CHUNK: usize = 4096;
/// completed intervals a slot will hold before dropping the oldest
const READY_DEPTH: usize = 2;

/// Encode-side state for the one local channel.
pub struct IntervalUploader {
    guid: [u8; 16],
    codec: Box<dyn BlockCodec>,
    interval_len: u32,
    frames_done: u32,
    pending: Vec<u8>,
    active: bool, // upload-begin for the current guid has been queued
    scratch_l: Vec<f32>,
    scratch_r: Vec<f32>,
}

impl IntervalUploader {
    pub fn new(codec: Box<dyn BlockCodec>) -> IntervalUploader {
        IntervalUploader {
            guid: new_guid(),
            codec,
            interval_len: 0,
            frames_done: 0,
            pending: vec![],
            active: false,
            scratch_l: vec![],
            scratch_r: vec![],
        }
    }

    pub fn guid(&self) -> [u8; 16] {
        self.guid
    }

    /// arm the uploader at join time with the first interval length
    pub fn start_session(&mut self, interval_len: u32) -> () {
        self.guid = new_guid();
        self.interval_len = interval_len;
        self.frames_done = 0;
        self.pending.clear();
        self.active = false;
    }

    /// not armed; waiting on the first room config
    pub fn is_idle(&self) -> bool {
        self.interval_len == 0
    }

    /// graceful stop: finish the interval in flight, then go quiet
    pub fn stop_session(&mut self, out: &mut Vec<ClientMessage>) -> () {
        if self.active {
            self.terminate_interval(out);
        }
        self.interval_len = 0;
    }

    /// hard stop for a dead connection; nothing goes on the wire
    pub fn abort_session(&mut self) -> () {
        self.interval_len = 0;
        self.frames_done = 0;
        self.pending.clear();
        self.active = false;
    }

    fn flush_pending(&mut self, out: &mut Vec<ClientMessage>) -> () {
        if !self.pending.is_empty() {
            out.push(ClientMessage::UploadWrite {
                guid: self.guid,
                flags: 0,
                payload: std::mem::take(&mut self.pending),
            });
        }
    }

    /// late bytes flush first, then the empty terminating chunk
    fn terminate_interval(&mut self, out: &mut Vec<ClientMessage>) -> () {
        self.codec.finalize(&mut self.pending);
        self.flush_pending(out);
        out.push(ClientMessage::UploadWrite {
            guid: self.guid,
            flags: INTERVAL_FLAG_LAST,
            payload: vec![],
        });
        self.active = false;
    }

    /// Feed PCM pulled off the audio ring.  `next_len` is the interval length
    /// to adopt at the next boundary (it differs from the current one only
    /// right after a tempo change).  Wire messages come back through `out`.
    pub fn feed(
        &mut self,
        frames: &[[f32; 2]],
        next_len: u32,
        transmit: bool,
        out: &mut Vec<ClientMessage>,
    ) -> () {
        if self.interval_len == 0 {
            return; // not in a session
        }
        if !transmit {
            // finish whatever was in flight, then go quiet
            if self.active {
                self.terminate_interval(out);
                self.guid = new_guid();
                self.frames_done = 0;
            }
            return;
        }
        let mut i = 0;
        while i < frames.len() {
            if !self.active {
                out.push(ClientMessage::UploadBegin {
                    guid: self.guid,
                    estimated_size: 0,
                    fourcc: self.codec.fourcc(),
                    channel_index: 0,
                });
                self.active = true;
            }
            let remain = (self.interval_len - self.frames_done) as usize;
            let n = remain.min(frames.len() - i);
            self.scratch_l.clear();
            self.scratch_r.clear();
            for f in &frames[i..i + n] {
                self.scratch_l.push(f[0]);
                self.scratch_r.push(f[1]);
            }
            self.codec
                .encode_block(&self.scratch_l, &self.scratch_r, &mut self.pending);
            self.frames_done += n as u32;
            i += n;
            if self.pending.len() >= UPLOAD_CHUNK {
                self.flush_pending(out);
            }
            if self.frames_done == self.interval_len {
                self.terminate_interval(out);
                self.guid = new_guid();
                self.frames_done = 0;
                self.interval_len = next_len;
                debug!("rotated upload interval, next len {}", next_len);
            }
        }
    }
}

/// who a slot is carrying
#[derive(Debug, Clone, PartialEq)]
pub struct SlotKey {
    pub user: String,
    pub channel_index: u8,
}

struct PlayCursor {
    buf: Vec<[f32; 2]>,
    pos: usize,
}

/// Decode-side state for one subscribed peer channel, bound to one mixer
/// slot and one preallocated ring toward the audio callback.
pub struct SlotPipe {
    assigned: Option<SlotKey>,
    decoder: Box<dyn BlockCodec>,
    current_guid: Option<[u8; 16]>,
    decoding: Vec<[f32; 2]>,
    ready: VecDeque<Vec<[f32; 2]>>,
    playing: Option<PlayCursor>,
    tx: spsc::Producer<[f32; 2]>,
    peak: (f32, f32),
}

impl SlotPipe {
    pub fn new(decoder: Box<dyn BlockCodec>, tx: spsc::Producer<[f32; 2]>) -> SlotPipe {
        SlotPipe {
            assigned: None,
            decoder,
            current_guid: None,
            decoding: vec![],
            ready: VecDeque::new(),
            playing: None,
            tx,
            peak: (0.0, 0.0),
        }
    }

    pub fn assigned(&self) -> Option<&SlotKey> {
        self.assigned.as_ref()
    }
    pub fn is_free(&self) -> bool {
        self.assigned.is_none()
    }
    pub fn peak(&self) -> (f32, f32) {
        self.peak
    }

    pub fn assign(&mut self, key: SlotKey) -> () {
        self.assigned = Some(key);
        self.reset_stream();
    }

    pub fn release(&mut self) -> () {
        self.assigned = None;
        self.reset_stream();
    }

    /// drop the interval being decoded (bad payload); finished ones survive
    pub fn abort_current(&mut self) -> () {
        self.current_guid = None;
        self.decoding.clear();
        self.decoder.reset();
    }

    fn reset_stream(&mut self) -> () {
        self.decoder.reset();
        self.current_guid = None;
        self.decoding.clear();
        self.ready.clear();
        self.playing = None;
        self.peak = (0.0, 0.0);
    }

    /// a new interval announcement for this slot
    pub fn begin_interval(
        &mut self,
        guid: [u8; 16],
        _estimated_size: u32,
        fourcc: [u8; 4],
    ) -> Result<(), BoxError> {
        // a begin supersedes any half-received interval
        if self.current_guid.take().is_some() {
            debug!("dropping partial interval on new begin");
            self.decoding.clear();
        }
        self.decoder.reset();
        if fourcc == [0; 4] {
            return Ok(()); // abort marker, nothing follows
        }
        if codec_for_fourcc(&fourcc).is_none() {
            simple_error::bail!(
                "unsupported stream tag {:02x?} from peer",
                fourcc
            );
        }
        self.current_guid = Some(guid);
        Ok(())
    }

    /// a chunk for this slot.  Returns true when the interval completed.
    pub fn write_chunk(
        &mut self,
        guid: [u8; 16],
        flags: u8,
        payload: &[u8],
    ) -> Result<bool, BoxError> {
        match self.current_guid {
            Some(g) if g == guid => {}
            _ => {
                // stale or unknown guid; the sender moved on without us
                return Ok(false);
            }
        }
        self.decoder.decode_block(payload, &mut self.decoding)?;
        if flags & INTERVAL_FLAG_LAST != 0 {
            let done = std::mem::take(&mut self.decoding);
            if !done.is_empty() {
                if self.ready.len() >= READY_DEPTH {
                    warn!("slot backlog, dropping oldest interval");
                    self.ready.pop_front();
                }
                self.ready.push_back(done);
            }
            self.current_guid = None;
            return Ok(true);
        }
        Ok(false)
    }

    /// called once per worker tick; `boundary` is true when the shared clock
    /// wrapped since the last tick
    pub fn pump(&mut self, boundary: bool) -> () {
        if boundary && self.playing.is_none() {
            if let Some(buf) = self.ready.pop_front() {
                self.playing = Some(PlayCursor { buf, pos: 0 });
            }
        }
        if let Some(cursor) = &mut self.playing {
            let space = self.tx.space();
            let n = space.min(cursor.buf.len() - cursor.pos);
            if n > 0 {
                let chunk = &cursor.buf[cursor.pos..cursor.pos + n];
                let mut peak_l: f32 = 0.0;
                let mut peak_r: f32 = 0.0;
                for f in chunk {
                    peak_l = peak_l.max(f[0].abs());
                    peak_r = peak_r.max(f[1].abs());
                }
                self.peak = (peak_l, peak_r);
                self.tx.push_slice(chunk);
                cursor.pos += n;
            }
            if cursor.pos >= cursor.buf.len() {
                self.playing = None;
            }
        }
    }
}
