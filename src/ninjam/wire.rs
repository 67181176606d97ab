//! NINJAM wire messages.
//!
//! Everything on the TCP stream is a 1 byte type plus a 4 byte little endian
//! payload length, then the payload.  The layouts here follow the protocol
//! spoken by the public servers, so this client is drop-in compatible with
//! them.  Multi-byte integers are little endian throughout.
use byteorder::{ByteOrder, LittleEndian};
use num_derive::FromPrimitive;
use simple_error::bail;
use std::fmt;

use crate::common::box_error::BoxError;

pub const MSG_SERVER_AUTH_CHALLENGE: u8 = 0x00;
pub const MSG_SERVER_AUTH_REPLY: u8 = 0x01;
pub const MSG_SERVER_CONFIG_CHANGE: u8 = 0x02;
pub const MSG_SERVER_USERINFO_CHANGE: u8 = 0x03;
pub const MSG_SERVER_INTERVAL_BEGIN: u8 = 0x04;
pub const MSG_SERVER_INTERVAL_WRITE: u8 = 0x05;
pub const MSG_CLIENT_AUTH_USER: u8 = 0x80;
pub const MSG_CLIENT_SET_USERMASK: u8 = 0x81;
pub const MSG_CLIENT_SET_CHANNEL_INFO: u8 = 0x82;
pub const MSG_CLIENT_UPLOAD_BEGIN: u8 = 0x83;
pub const MSG_CLIENT_UPLOAD_WRITE: u8 = 0x84;
pub const MSG_CHAT: u8 = 0xc0;
pub const MSG_KEEPALIVE: u8 = 0xfd;

/// framing header is type + length
pub const FRAME_HEADER_SIZE: usize = 5;
/// refuse anything bigger than this; a legit interval chunk is a few KB
pub const MAX_PAYLOAD: usize = 1 << 20;

/// protocol version we announce in client-auth-user
pub const PROTOCOL_VERSION: u32 = 0x0002_0000;
/// caps bit meaning "user agreed to the server license"
pub const CAPS_LICENSE_AGREED: u32 = 1;

/// server caps byte 1 carries the keepalive interval in seconds
pub fn keepalive_from_caps(caps: u32) -> u32 {
    let secs = (caps >> 8) & 0xff;
    if secs == 0 {
        10
    } else {
        secs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive)]
pub enum MessageType {
    ServerAuthChallenge = 0x00,
    ServerAuthReply = 0x01,
    ServerConfigChange = 0x02,
    ServerUserInfoChange = 0x03,
    ServerIntervalBegin = 0x04,
    ServerIntervalWrite = 0x05,
    ClientAuthUser = 0x80,
    ClientSetUserMask = 0x81,
    ClientSetChannelInfo = 0x82,
    ClientUploadBegin = 0x83,
    ClientUploadWrite = 0x84,
    Chat = 0xc0,
    KeepAlive = 0xfd,
}

/// one peer channel row inside a userinfo change
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfoEntry {
    pub active: bool,
    pub channel_index: u8,
    pub volume: i16,
    pub pan: i8,
    pub flags: u8,
    pub user: String,
    pub channel_name: String,
}

/// one local channel row inside client-set-channel-info
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub volume: i16,
    pub pan: i8,
    pub flags: u8,
}

/// flag bit on channel info meaning the channel is broadcasting
pub const CHANNEL_FLAG_TRANSMIT: u8 = 1;
/// final chunk marker on interval writes
pub const INTERVAL_FLAG_LAST: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    AuthChallenge {
        challenge: [u8; 8],
        server_caps: u32,
        protocol_version: u32,
        license: Option<String>,
    },
    AuthReply {
        success: bool,
        message: String,
        max_channels: u8,
    },
    ConfigChange {
        bpm: u16,
        bpi: u16,
    },
    UserInfoChange {
        entries: Vec<UserInfoEntry>,
    },
    IntervalBegin {
        guid: [u8; 16],
        estimated_size: u32,
        fourcc: [u8; 4],
        channel_index: u8,
        user: String,
    },
    IntervalWrite {
        guid: [u8; 16],
        flags: u8,
        payload: Vec<u8>,
    },
    Chat {
        parts: Vec<String>,
    },
    KeepAlive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    AuthUser {
        passhash: [u8; 20],
        username: String,
        caps: u32,
        protocol_version: u32,
    },
    SetUserMask {
        entries: Vec<(String, u32)>,
    },
    SetChannelInfo {
        channels: Vec<ChannelInfo>,
    },
    UploadBegin {
        guid: [u8; 16],
        estimated_size: u32,
        fourcc: [u8; 4],
        channel_index: u8,
    },
    UploadWrite {
        guid: [u8; 16],
        flags: u8,
        payload: Vec<u8>,
    },
    KeepAlive,
}

// --- payload readers -------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
    fn take(&mut self, n: usize) -> Result<&'a [u8], BoxError> {
        if self.remaining() < n {
            bail!("short payload");
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
    fn u8(&mut self) -> Result<u8, BoxError> {
        Ok(self.take(1)?[0])
    }
    fn i8(&mut self) -> Result<i8, BoxError> {
        Ok(self.take(1)?[0] as i8)
    }
    fn u16(&mut self) -> Result<u16, BoxError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }
    fn i16(&mut self) -> Result<i16, BoxError> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }
    fn u32(&mut self) -> Result<u32, BoxError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }
    /// NUL terminated string; the protocol allows empty
    fn cstr(&mut self) -> Result<String, BoxError> {
        match self.data[self.pos..].iter().position(|b| *b == 0) {
            Some(n) => {
                let raw = self.take(n)?;
                self.pos += 1; // swallow the NUL
                Ok(String::from_utf8_lossy(raw).into_owned())
            }
            None => bail!("unterminated string"),
        }
    }
    fn rest(&mut self) -> &'a [u8] {
        let s = &self.data[self.pos..];
        self.pos = self.data.len();
        s
    }
}

fn push_cstr(out: &mut Vec<u8>, s: &str) -> () {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

// --- server messages -------------------------------------------------------

impl ServerMessage {
    /// decode a framed payload that arrived with the given type byte
    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<ServerMessage, BoxError> {
        let mut r = Reader::new(payload);
        match msg_type {
            MSG_SERVER_AUTH_CHALLENGE => {
                let mut challenge = [0u8; 8];
                challenge.copy_from_slice(r.take(8)?);
                let server_caps = r.u32()?;
                let protocol_version = r.u32()?;
                let license = if server_caps & CAPS_LICENSE_AGREED != 0 && r.remaining() > 0 {
                    Some(r.cstr()?)
                } else {
                    None
                };
                Ok(ServerMessage::AuthChallenge {
                    challenge,
                    server_caps,
                    protocol_version,
                    license,
                })
            }
            MSG_SERVER_AUTH_REPLY => {
                let flags = r.u8()?;
                let message = if r.remaining() > 1 { r.cstr()? } else { String::new() };
                let max_channels = if r.remaining() > 0 { r.u8()? } else { 0 };
                Ok(ServerMessage::AuthReply {
                    success: flags & 1 != 0,
                    message,
                    max_channels,
                })
            }
            MSG_SERVER_CONFIG_CHANGE => Ok(ServerMessage::ConfigChange {
                bpm: r.u16()?,
                bpi: r.u16()?,
            }),
            MSG_SERVER_USERINFO_CHANGE => {
                let mut entries = vec![];
                while r.remaining() > 0 {
                    entries.push(UserInfoEntry {
                        active: r.u8()? != 0,
                        channel_index: r.u8()?,
                        volume: r.i16()?,
                        pan: r.i8()?,
                        flags: r.u8()?,
                        user: r.cstr()?,
                        channel_name: r.cstr()?,
                    });
                }
                Ok(ServerMessage::UserInfoChange { entries })
            }
            MSG_SERVER_INTERVAL_BEGIN => {
                let mut guid = [0u8; 16];
                guid.copy_from_slice(r.take(16)?);
                let estimated_size = r.u32()?;
                let mut fourcc = [0u8; 4];
                fourcc.copy_from_slice(r.take(4)?);
                let channel_index = r.u8()?;
                let user = r.cstr()?;
                Ok(ServerMessage::IntervalBegin {
                    guid,
                    estimated_size,
                    fourcc,
                    channel_index,
                    user,
                })
            }
            MSG_SERVER_INTERVAL_WRITE => {
                let mut guid = [0u8; 16];
                guid.copy_from_slice(r.take(16)?);
                let flags = r.u8()?;
                Ok(ServerMessage::IntervalWrite {
                    guid,
                    flags,
                    payload: r.rest().to_vec(),
                })
            }
            MSG_CHAT => {
                let mut parts = vec![];
                while r.remaining() > 0 {
                    parts.push(r.cstr()?);
                }
                Ok(ServerMessage::Chat { parts })
            }
            MSG_KEEPALIVE => Ok(ServerMessage::KeepAlive),
            _ => bail!("unknown server message type 0x{:02x}", msg_type),
        }
    }
}

// --- client messages -------------------------------------------------------

impl ClientMessage {
    fn type_byte(&self) -> u8 {
        match self {
            ClientMessage::AuthUser { .. } => MSG_CLIENT_AUTH_USER,
            ClientMessage::SetUserMask { .. } => MSG_CLIENT_SET_USERMASK,
            ClientMessage::SetChannelInfo { .. } => MSG_CLIENT_SET_CHANNEL_INFO,
            ClientMessage::UploadBegin { .. } => MSG_CLIENT_UPLOAD_BEGIN,
            ClientMessage::UploadWrite { .. } => MSG_CLIENT_UPLOAD_WRITE,
            ClientMessage::KeepAlive => MSG_KEEPALIVE,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = vec![];
        match self {
            ClientMessage::AuthUser {
                passhash,
                username,
                caps,
                protocol_version,
            } => {
                out.extend_from_slice(passhash);
                push_cstr(&mut out, username);
                out.extend_from_slice(&caps.to_le_bytes());
                out.extend_from_slice(&protocol_version.to_le_bytes());
            }
            ClientMessage::SetUserMask { entries } => {
                for (user, mask) in entries {
                    push_cstr(&mut out, user);
                    out.extend_from_slice(&mask.to_le_bytes());
                }
            }
            ClientMessage::SetChannelInfo { channels } => {
                // per-channel parameter block size, so old servers can skip
                // fields they don't know
                out.extend_from_slice(&4u16.to_le_bytes());
                for ch in channels {
                    push_cstr(&mut out, &ch.name);
                    out.extend_from_slice(&ch.volume.to_le_bytes());
                    out.push(ch.pan as u8);
                    out.push(ch.flags);
                }
            }
            ClientMessage::UploadBegin {
                guid,
                estimated_size,
                fourcc,
                channel_index,
            } => {
                out.extend_from_slice(guid);
                out.extend_from_slice(&estimated_size.to_le_bytes());
                out.extend_from_slice(fourcc);
                out.push(*channel_index);
            }
            ClientMessage::UploadWrite {
                guid,
                flags,
                payload,
            } => {
                out.extend_from_slice(guid);
                out.push(*flags);
                out.extend_from_slice(payload);
            }
            ClientMessage::KeepAlive => {}
        }
        out
    }

    /// full frame ready for the socket
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        out.push(self.type_byte());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }
}

// --- stream framer ---------------------------------------------------------

/// Accumulates raw socket bytes and peels off complete frames.
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader {
            buf: Vec::with_capacity(4096),
        }
    }
    pub fn push_bytes(&mut self, data: &[u8]) -> () {
        self.buf.extend_from_slice(data);
    }
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
    /// pop one complete frame if the buffer holds one
    pub fn next_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, BoxError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let msg_type = self.buf[0];
        let len = LittleEndian::read_u32(&self.buf[1..5]) as usize;
        if len > MAX_PAYLOAD {
            bail!("oversized frame: {} bytes", len);
        }
        if self.buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        let payload = self.buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        self.buf.drain(..FRAME_HEADER_SIZE + len);
        Ok(Some((msg_type, payload)))
    }
}

// --- quantizers ------------------------------------------------------------

/// linear volume to the wire's tenth-of-a-dB signed short
pub fn volume_to_wire(v: f32) -> i16 {
    if v <= 0.0 {
        return i16::MIN;
    }
    let db = 20.0 * f32::log10(v);
    (db * 10.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn volume_from_wire(v: i16) -> f32 {
    if v == i16::MIN {
        return 0.0;
    }
    f32::powf(10.0, v as f32 / 10.0 / 20.0)
}

/// pan [-1, 1] to the wire's signed byte
pub fn pan_to_wire(p: f32) -> i8 {
    (p.clamp(-1.0, 1.0) * 127.0).round() as i8
}

pub fn pan_from_wire(p: i8) -> f32 {
    (p as f32 / 127.0).clamp(-1.0, 1.0)
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerMessage::IntervalWrite { flags, payload, .. } => {
                write!(f, "IntervalWrite {{ flags: {}, bytes: {} }}", flags, payload.len())
            }
            other => write!(f, "{:?}", other),
        }
    }
}
