//! the long lived network worker.
//!
//! Spawned on host activation, joined on deactivation.  Every pass it ticks
//! the engine once, handles a license rendezvous if one came up, then sleeps
//! adaptively: short while a session is moving, capped at 10ms when idle so
//! u/x actions never feel stuck.
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, sleep, JoinHandle};
use std::time::Duration;

use crate::ninjam::engine::{EngineShared, NinjamEngine};
use crate::ninjam::{Tick, STATE_FAILED, STATE_IDLE};
use crate::utils::get_micro_time;

use super::license::{LicenseSlot, LICENSE_TIMEOUT};

const ACTIVE_SLEEP: Duration = Duration::from_millis(2);
const IDLE_SLEEP: Duration = Duration::from_millis(10);

pub struct WorkerHandle {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// start the worker; it owns the engine tick loop until stopped
pub fn spawn(
    engine: Arc<Mutex<NinjamEngine>>,
    shared: Arc<EngineShared>,
    license: Arc<LicenseSlot>,
) -> WorkerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let handle = thread::spawn(move || {
        info!("worker up");
        worker_loop(engine, shared, license, stop_flag);
        info!("worker down");
    });
    WorkerHandle {
        handle: Some(handle),
        stop,
    }
}

fn worker_loop(
    engine: Arc<Mutex<NinjamEngine>>,
    shared: Arc<EngineShared>,
    license: Arc<LicenseSlot>,
    stop: Arc<AtomicBool>,
) -> () {
    loop {
        if stop.load(Ordering::Relaxed) {
            engine.lock().unwrap().shutdown();
            break;
        }
        let tick = {
            let mut engine = engine.lock().unwrap();
            engine.run(get_micro_time())
        };
        match tick {
            Ok(Tick::License(text)) => {
                // engine mutex is released while we park on the slot
                match license.request(&text, LICENSE_TIMEOUT, &stop) {
                    Some(decision) => {
                        engine.lock().unwrap().set_license_response(decision);
                    }
                    None => {
                        // a second prompt while one is pending is a protocol
                        // violation; drop the session
                        warn!("overlapping license prompts, disconnecting");
                        engine.lock().unwrap().disconnect();
                    }
                }
            }
            Ok(Tick::Progressed) | Ok(Tick::Idle) => {}
            Err(e) => {
                debug!("tick ended session: {}", e);
            }
        }
        let tag = shared.state.load(Ordering::Acquire);
        let nap = if tag == STATE_IDLE || tag == STATE_FAILED {
            IDLE_SLEEP
        } else {
            ACTIVE_SLEEP
        };
        sleep(nap);
    }
}

impl WorkerHandle {
    /// signal the thread and wait for it; bounded by the sleep cap
    pub fn stop_and_join(&mut self) -> () {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod test_worker {
    use super::*;
    use crate::common::settings::LocalChannelSettings;
    use crate::common::spsc;
    use crate::ninjam::codec::CodecKind;
    use crate::ninjam::Session;
    use crate::plugin::snapshot::UiSnapshot;
    use crate::sound::mixer::{MixerControls, MIXER_SLOTS};

    fn build() -> (Arc<Mutex<NinjamEngine>>, Arc<EngineShared>) {
        let shared = Arc::new(EngineShared::new());
        let (events_tx, _events_rx) = spsc::channel(64);
        let (_xmit_tx, xmit_rx) = spsc::channel(1024);
        let mut slot_txs = vec![];
        for _ in 0..MIXER_SLOTS {
            let (tx, _rx) = spsc::channel(256);
            slot_txs.push(tx);
        }
        let engine = NinjamEngine::new(
            Session {
                sample_rate: 48_000,
                max_block: 128,
            },
            shared.clone(),
            Arc::new(MixerControls::new()),
            Arc::new(UiSnapshot::new()),
            events_tx,
            xmit_rx,
            slot_txs,
            CodecKind::Fixed16,
            LocalChannelSettings::default(),
        );
        (Arc::new(Mutex::new(engine)), shared)
    }

    #[test]
    fn starts_and_stops_cleanly() {
        let (engine, shared) = build();
        let mut worker = spawn(engine.clone(), shared, Arc::new(LicenseSlot::new()));
        // let it idle a few ticks
        sleep(Duration::from_millis(50));
        worker.stop_and_join();
        // the engine is still usable after the worker is gone
        assert!(engine.lock().unwrap().connect("127.0.0.1:1", "a", "b").is_ok());
    }

    #[test]
    fn drop_joins_the_thread() {
        let (engine, shared) = build();
        let worker = spawn(engine, shared, Arc::new(LicenseSlot::new()));
        drop(worker); // must not hang
    }
}
