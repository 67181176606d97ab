//! single slot rendezvous between the worker and the u/x for license
//! agreement prompts.
//!
//! The worker publishes the text and parks on the condvar; the u/x notices
//! the pending flag on its next frame, shows the modal, and answers.  The
//! wait resolves exactly once per request: user answer, the 60 second
//! timeout, or session teardown via the stop flag.  The engine mutex is
//! never held while waiting here.
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// how long the worker will hold the connection open waiting for an answer
pub const LICENSE_TIMEOUT: Duration = Duration::from_secs(60);
/// condvar wait slice so teardown is noticed promptly
const WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LicenseDecision {
    Accept,
    Reject,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Response {
    Pending,
    Accept,
    Reject,
}

struct SlotState {
    pending: bool,
    text: String,
    response: Response,
}

pub struct LicenseSlot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl LicenseSlot {
    pub fn new() -> LicenseSlot {
        LicenseSlot {
            state: Mutex::new(SlotState {
                pending: false,
                text: String::new(),
                response: Response::Pending,
            }),
            cv: Condvar::new(),
        }
    }

    /// Worker side.  Publishes the prompt and blocks until the u/x answers,
    /// the timeout passes, or `stop` goes true.  A request while another is
    /// pending is a protocol violation and comes back as `None`.
    pub fn request(
        &self,
        text: &str,
        timeout: Duration,
        stop: &AtomicBool,
    ) -> Option<LicenseDecision> {
        {
            let mut state = self.state.lock().unwrap();
            if state.pending {
                warn!("license prompt arrived while another is unresolved");
                return None;
            }
            state.pending = true;
            state.text = String::from(text);
            state.response = Response::Pending;
        }
        let mut waited = Duration::ZERO;
        let mut state = self.state.lock().unwrap();
        let decision = loop {
            match state.response {
                Response::Accept => break LicenseDecision::Accept,
                Response::Reject => break LicenseDecision::Reject,
                Response::Pending => {}
            }
            if stop.load(Ordering::Relaxed) || waited >= timeout {
                break LicenseDecision::Timeout;
            }
            let slice = WAIT_SLICE.min(timeout - waited);
            let (next, _timed_out) = self.cv.wait_timeout(state, slice).unwrap();
            state = next;
            waited += slice;
        };
        state.pending = false;
        state.text.clear();
        state.response = Response::Pending;
        Some(decision)
    }

    /// u/x side: the text to show, when a prompt is up
    pub fn pending_text(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.pending && state.response == Response::Pending {
            Some(state.text.clone())
        } else {
            None
        }
    }

    /// u/x side: answer the prompt
    pub fn respond(&self, accept: bool) -> () {
        let mut state = self.state.lock().unwrap();
        if !state.pending {
            return; // stale click, the prompt already resolved
        }
        state.response = if accept {
            Response::Accept
        } else {
            Response::Reject
        };
        drop(state);
        self.cv.notify_all();
    }
}
