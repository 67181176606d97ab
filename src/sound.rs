//! the real time mixing side of the client.
//!
//! Everything in here runs inside the host audio callback, so nothing may
//! allocate, lock, or touch a socket.  State arrives through the atomic
//! controls and the lock-free rings.
pub mod channel_strip;
pub mod click_track;
pub mod mixer;
