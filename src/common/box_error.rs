//! error type shared by everything that runs on the worker thread.
//!
//! The engine propagates socket, codec, and protocol failures up through one
//! boxed type so the worker loop can treat them uniformly.  Send + Sync so
//! results can cross thread spawns.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
