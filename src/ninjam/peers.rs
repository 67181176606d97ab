//! who else is in the room.
//!
//! The server announces users and their channels through userinfo change
//! notifies; this registry keeps the worker-side truth about them.  Think of
//! it as the guy running the board: as players come and go he writes their
//! names next to the strips they're patched into.  The u/x never reads this
//! directly, it gets a cloned snapshot refreshed when the dirty flag says
//! something moved.
use crate::ninjam::wire::{UserInfoEntry, CHANNEL_FLAG_TRANSMIT};

/// one channel a peer is publishing
#[derive(Debug, Clone, PartialEq)]
pub struct PeerChannel {
    pub channel_index: u8,
    pub name: String,
    /// do we want this channel's audio
    pub subscribed: bool,
    /// is the peer actually broadcasting it
    pub transmitting: bool,
    pub volume: f32,
    pub pan: f32,
    pub mute: bool,
    pub solo: bool,
    /// mixer slot carrying this channel, when subscribed and in capacity
    pub slot: Option<usize>,
    /// last decoded block peaks, worker-written
    pub peak: (f32, f32),
}

impl PeerChannel {
    fn new(channel_index: u8, name: String, transmitting: bool) -> PeerChannel {
        PeerChannel {
            channel_index,
            name,
            subscribed: true,
            transmitting,
            volume: 1.0,
            pan: 0.0,
            mute: false,
            solo: false,
            slot: None,
            peak: (0.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerUser {
    pub name: String,
    pub channels: Vec<PeerChannel>,
}

pub struct PeerRegistry {
    users: Vec<PeerUser>,
    dirty: bool,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        PeerRegistry {
            users: vec![],
            dirty: false,
        }
    }

    pub fn users(&self) -> &[PeerUser] {
        &self.users
    }
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn find_user(&self, name: &str) -> Option<usize> {
        self.users.iter().position(|u| u.name == name)
    }

    pub fn channel_mut(&mut self, user: usize, channel_index: u8) -> Option<&mut PeerChannel> {
        self.dirty = true;
        self.users
            .get_mut(user)?
            .channels
            .iter_mut()
            .find(|c| c.channel_index == channel_index)
    }

    pub fn channel(&self, user: usize, channel_index: u8) -> Option<&PeerChannel> {
        self.users
            .get(user)?
            .channels
            .iter()
            .find(|c| c.channel_index == channel_index)
    }

    /// fold a userinfo notify into the registry.  Returns true if anything
    /// changed shape (users or channels appeared or went away).
    pub fn apply_userinfo(&mut self, entries: &[UserInfoEntry]) -> bool {
        let mut changed = false;
        for e in entries {
            let transmitting = e.flags & CHANNEL_FLAG_TRANSMIT != 0;
            if e.active {
                let uidx = match self.find_user(&e.user) {
                    Some(i) => i,
                    None => {
                        self.users.push(PeerUser {
                            name: e.user.clone(),
                            channels: vec![],
                        });
                        changed = true;
                        self.users.len() - 1
                    }
                };
                let user = &mut self.users[uidx];
                match user
                    .channels
                    .iter_mut()
                    .find(|c| c.channel_index == e.channel_index)
                {
                    Some(ch) => {
                        if ch.name != e.channel_name || ch.transmitting != transmitting {
                            ch.name = e.channel_name.clone();
                            ch.transmitting = transmitting;
                            changed = true;
                        }
                    }
                    None => {
                        user.channels.push(PeerChannel::new(
                            e.channel_index,
                            e.channel_name.clone(),
                            transmitting,
                        ));
                        changed = true;
                    }
                }
            } else {
                // channel withdrawn; drop the user entirely once bare
                if let Some(uidx) = self.find_user(&e.user) {
                    let user = &mut self.users[uidx];
                    let before = user.channels.len();
                    user.channels.retain(|c| c.channel_index != e.channel_index);
                    if user.channels.len() != before {
                        changed = true;
                    }
                    if user.channels.is_empty() {
                        self.users.remove(uidx);
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.dirty = true;
        }
        changed
    }

    /// subscription bits for one user, for server-set-usermask
    pub fn user_mask(&self, user: usize) -> u32 {
        let mut mask = 0u32;
        if let Some(u) = self.users.get(user) {
            for c in &u.channels {
                if c.subscribed && c.channel_index < 32 {
                    mask |= 1 << c.channel_index;
                }
            }
        }
        mask
    }

    /// meter refresh; deliberately does not set the dirty flag, the u/x
    /// resamples meters anyway
    pub fn set_channel_peak(&mut self, user_name: &str, channel_index: u8, peak: (f32, f32)) -> () {
        if let Some(u) = self.users.iter_mut().find(|u| u.name == user_name) {
            if let Some(c) = u
                .channels
                .iter_mut()
                .find(|c| c.channel_index == channel_index)
            {
                c.peak = peak;
            }
        }
    }

    pub fn clear(&mut self) -> () {
        if !self.users.is_empty() {
            self.dirty = true;
        }
        self.users.clear();
    }

    /// clone for the u/x; clears the dirty flag
    pub fn snapshot(&mut self) -> Vec<PeerUser> {
        self.dirty = false;
        self.users.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod test_peers {
    use super::*;

    fn entry(user: &str, chan: &str, idx: u8, active: bool) -> UserInfoEntry {
        UserInfoEntry {
            active,
            channel_index: idx,
            volume: 0,
            pan: 0,
            flags: CHANNEL_FLAG_TRANSMIT,
            user: String::from(user),
            channel_name: String::from(chan),
        }
    }

    #[test]
    fn users_appear_and_vanish() {
        let mut reg = PeerRegistry::new();
        assert!(reg.apply_userinfo(&[entry("bob", "gtr", 0, true), entry("bob", "vox", 1, true)]));
        assert_eq!(reg.users().len(), 1);
        assert_eq!(reg.users()[0].channels.len(), 2);

        // same notify again changes nothing
        assert!(!reg.apply_userinfo(&[entry("bob", "gtr", 0, true)]));

        assert!(reg.apply_userinfo(&[entry("bob", "gtr", 0, false)]));
        assert_eq!(reg.users()[0].channels.len(), 1);
        assert!(reg.apply_userinfo(&[entry("bob", "vox", 1, false)]));
        assert!(reg.is_empty());
    }

    #[test]
    fn mask_follows_subscriptions() {
        let mut reg = PeerRegistry::new();
        reg.apply_userinfo(&[entry("sue", "keys", 0, true), entry("sue", "drums", 3, true)]);
        let uidx = reg.find_user("sue").unwrap();
        assert_eq!(reg.user_mask(uidx), 0b1001);
        reg.channel_mut(uidx, 3).unwrap().subscribed = false;
        assert_eq!(reg.user_mask(uidx), 0b0001);
    }

    #[test]
    fn snapshot_clears_dirty() {
        let mut reg = PeerRegistry::new();
        reg.apply_userinfo(&[entry("bob", "gtr", 0, true)]);
        assert!(reg.is_dirty());
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(!reg.is_dirty());
    }
}
