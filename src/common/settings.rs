//! persisted plugin settings.
//!
//! The host hands us an opaque state blob to fill and restore; we keep it as
//! a small versioned JSON document.  Loading tolerates unknown fields and
//! documents written by older versions (missing fields fall back to their
//! defaults).  Passwords never go in here.
use serde::{Deserialize, Serialize};
use std::io::Write;

use super::box_error::BoxError;

pub const SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub volume: f32,
    pub mute: bool,
}

impl Default for BusSettings {
    fn default() -> BusSettings {
        BusSettings {
            volume: 1.0,
            mute: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalChannelSettings {
    pub name: String,
    pub transmit: bool,
    pub bitrate: u32,
}

impl Default for LocalChannelSettings {
    fn default() -> LocalChannelSettings {
        LocalChannelSettings {
            name: String::from("channel"),
            transmit: true,
            bitrate: 64,
        }
    }
}

/// Everything the plugin remembers between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedSettings {
    pub version: u32,
    pub server: String,
    pub username: String,
    pub master: BusSettings,
    pub metronome: BusSettings,
    #[serde(rename = "localChannel")]
    pub local_channel: LocalChannelSettings,
}

impl Default for SavedSettings {
    fn default() -> SavedSettings {
        SavedSettings {
            version: SETTINGS_VERSION,
            server: String::new(),
            username: String::new(),
            master: BusSettings::default(),
            metronome: BusSettings {
                volume: 0.5,
                mute: false,
            },
            local_channel: LocalChannelSettings::default(),
        }
    }
}

impl SavedSettings {
    pub fn to_json(&self) -> Result<String, BoxError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
    /// parse a settings document, tolerating junk the current version does
    /// not know about
    pub fn from_json(data: &str) -> Result<SavedSettings, BoxError> {
        let mut settings: SavedSettings = serde_json::from_str(data)?;
        settings.version = SETTINGS_VERSION;
        Ok(settings)
    }
    /// write the document to any sink, looping on short writes
    pub fn write_to(&self, sink: &mut dyn Write) -> Result<(), BoxError> {
        let doc = self.to_json()?;
        let mut bytes = doc.as_bytes();
        while !bytes.is_empty() {
            let n = sink.write(bytes)?;
            if n == 0 {
                simple_error::bail!("settings sink refused bytes");
            }
            bytes = &bytes[n..];
        }
        sink.flush()?;
        Ok(())
    }
}
