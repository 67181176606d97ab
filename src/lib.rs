//! njam_plug - NINJAM jam client core for hosting inside a DAW
//!
//! Provides the pieces needed to run an interval-based jam session from a
//! plugin instance: the NINJAM protocol engine, the real-time mixer that runs
//! inside the host audio callback, and the worker thread that owns all socket
//! and codec work.
//!
//! The [`plugin::NinjamPlugin`] type is the top level object a host binding
//! creates.  It owns one engine, one worker, and the lock-free plumbing in
//! between.  Nothing in this crate is global.

pub mod common;
pub mod dsp;
pub mod ninjam;
pub mod plugin;
pub mod sound;
pub mod utils;
