//! Two full plugin instances jamming through a scripted loopback server.
//!
//! The stub speaks just enough of the server side of the protocol to route
//! interval uploads from one client to the other: challenge/auth, config
//! push, userinfo fan-out, and upload -> download forwarding.
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use njam_plug::ninjam::wire::{
    FrameReader, MSG_CLIENT_AUTH_USER, MSG_CLIENT_SET_CHANNEL_INFO, MSG_CLIENT_UPLOAD_BEGIN,
    MSG_CLIENT_UPLOAD_WRITE, PROTOCOL_VERSION,
};
use njam_plug::ninjam::{STATE_JOINED, UiEvent};
use njam_plug::plugin::audio_path::Transport;
use njam_plug::plugin::NinjamPlugin;

const BPM: u16 = 600;
const BPI: u16 = 4;
const SAMPLE_RATE: u32 = 48_000;
// 48000 * 60 * 4 / 600
const INTERVAL_FRAMES: usize = 19_200;
const BLOCK: usize = 256;

fn frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![msg_type];
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn challenge_frame() -> Vec<u8> {
    let mut payload = vec![1, 2, 3, 4, 5, 6, 7, 8];
    payload.extend_from_slice(&(5u32 << 8).to_le_bytes()); // keepalive 5s, no license
    payload.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    frame(0x00, &payload)
}

fn auth_reply_frame() -> Vec<u8> {
    let mut payload = vec![1u8];
    payload.extend_from_slice(b"ok\0");
    payload.push(32);
    frame(0x01, &payload)
}

fn config_frame() -> Vec<u8> {
    let mut payload = vec![];
    payload.extend_from_slice(&BPM.to_le_bytes());
    payload.extend_from_slice(&BPI.to_le_bytes());
    frame(0x02, &payload)
}

fn userinfo_frame(user: &str, chan: &str) -> Vec<u8> {
    let mut payload = vec![1u8, 0u8];
    payload.extend_from_slice(&0i16.to_le_bytes());
    payload.push(0); // pan
    payload.push(1); // transmitting
    payload.extend_from_slice(user.as_bytes());
    payload.push(0);
    payload.extend_from_slice(chan.as_bytes());
    payload.push(0);
    frame(0x03, &payload)
}

fn cstr_at(data: &[u8], from: usize) -> String {
    let end = data[from..]
        .iter()
        .position(|b| *b == 0)
        .map(|p| from + p)
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[from..end]).into_owned()
}

struct RoomClient {
    sock: TcpStream,
    framer: FrameReader,
    name: Option<String>,
    chan: Option<String>,
    announced_peer: bool,
}

/// minimal two-seat room: routes uploads from each seat to the other
fn run_room(listener: TcpListener, stop: Arc<AtomicBool>) {
    listener.set_nonblocking(true).unwrap();
    let mut seats: Vec<RoomClient> = vec![];
    let mut scratch = [0u8; 8192];
    while !stop.load(Ordering::Relaxed) {
        if seats.len() < 2 {
            if let Ok((sock, _)) = listener.accept() {
                sock.set_nonblocking(false).unwrap();
                sock.set_read_timeout(Some(Duration::from_millis(2))).unwrap();
                sock.set_nodelay(true).unwrap();
                let mut client = RoomClient {
                    sock,
                    framer: FrameReader::new(),
                    name: None,
                    chan: None,
                    announced_peer: false,
                };
                client.sock.write_all(&challenge_frame()).unwrap();
                seats.push(client);
            }
        }
        for i in 0..seats.len() {
            match seats[i].sock.read(&mut scratch) {
                Ok(0) => {}
                Ok(n) => seats[i].framer.push_bytes(&scratch[..n]),
                Err(_) => {}
            }
            while let Ok(Some((t, payload))) = seats[i].framer.next_frame() {
                route(&mut seats, i, t, payload);
            }
        }
        // late announcement: tell each seat about the other once both are in
        for i in 0..seats.len() {
            let j = 1 - i;
            if seats.len() == 2 && !seats[i].announced_peer && seats[i].name.is_some() {
                if let (Some(name), Some(chan)) =
                    (seats[j].name.clone(), seats[j].chan.clone())
                {
                    let _ = seats[i].sock.write_all(&userinfo_frame(&name, &chan));
                    seats[i].announced_peer = true;
                }
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn route(seats: &mut Vec<RoomClient>, from: usize, msg_type: u8, payload: Vec<u8>) {
    match msg_type {
        MSG_CLIENT_AUTH_USER => {
            let name = cstr_at(&payload, 20);
            seats[from].name = Some(name);
            seats[from].sock.write_all(&auth_reply_frame()).unwrap();
            seats[from].sock.write_all(&config_frame()).unwrap();
        }
        MSG_CLIENT_SET_CHANNEL_INFO => {
            // param size u16, then first channel name
            let name = cstr_at(&payload, 2);
            seats[from].chan = Some(name);
        }
        MSG_CLIENT_UPLOAD_BEGIN => {
            let sender = match seats[from].name.clone() {
                Some(n) => n,
                None => return,
            };
            let to = 1 - from;
            if seats.len() < 2 || seats[to].name.is_none() {
                return;
            }
            // download-begin is the upload payload plus the sender's name
            let mut fwd = payload.clone();
            fwd.extend_from_slice(sender.as_bytes());
            fwd.push(0);
            let _ = seats[to].sock.write_all(&frame(0x04, &fwd));
        }
        MSG_CLIENT_UPLOAD_WRITE => {
            let to = 1 - from;
            if seats.len() < 2 {
                return;
            }
            let _ = seats[to].sock.write_all(&frame(0x05, &payload));
        }
        _ => {} // keepalive, usermask: nothing to route
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, pred: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn interval_travels_between_two_clients() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let stop = Arc::new(AtomicBool::new(false));
    let room = {
        let stop = stop.clone();
        thread::spawn(move || run_room(listener, stop))
    };

    let mut alice = NinjamPlugin::new();
    alice.activate(SAMPLE_RATE, BLOCK).unwrap();
    alice.set_local_channel_info("gtr", true, 64);
    alice.set_param(3, 1.0); // metronome mute
    alice.connect(&addr, "alice", "pw").unwrap();

    let mut bobby = NinjamPlugin::new();
    bobby.activate(SAMPLE_RATE, BLOCK).unwrap();
    bobby.set_local_channel_info("bass", true, 64);
    bobby.set_param(3, 1.0);
    bobby.connect(&addr, "bobby", "pw").unwrap();

    wait_for("both clients joined", Duration::from_secs(5), || {
        alice.connection_state() == STATE_JOINED && bobby.connection_state() == STATE_JOINED
    });

    // drive both audio callbacks: alice plays a 1 kHz sine, bobby is silent
    let amp = 0.5f32;
    let mut phase = 0.0f32;
    let phase_inc = 2.0 * std::f32::consts::PI * 1000.0 / SAMPLE_RATE as f32;
    let mut bobby_heard: Vec<f32> = vec![];
    let silence = [0.0f32; BLOCK];
    let mut in_a = [0.0f32; BLOCK];
    let mut out_a = [0.0f32; BLOCK];
    let mut out_b = [0.0f32; BLOCK];
    let mut bout_a = [0.0f32; BLOCK];
    let mut bout_b = [0.0f32; BLOCK];

    let blocks = INTERVAL_FRAMES / BLOCK * 4; // four intervals of audio
    for _ in 0..blocks {
        for v in in_a.iter_mut() {
            *v = amp * phase.sin();
            phase += phase_inc;
        }
        let in_b = in_a;
        alice.process(
            Some(&in_a),
            Some(&in_b),
            Some(&mut out_a),
            Some(&mut out_b),
            &Transport::default(),
            &[],
        );
        bobby.process(
            Some(&silence),
            Some(&silence),
            Some(&mut bout_a),
            Some(&mut bout_b),
            &Transport::default(),
            &[],
        );
        bobby_heard.extend_from_slice(&bout_a);
        // keep roughly real-time-ish pacing so the workers can move chunks
        thread::sleep(Duration::from_micros(1500));
    }

    // bobby's u/x learned about alice
    let peers = bobby.peers();
    let alice_seat = peers.iter().find(|u| u.name == "alice");
    assert!(alice_seat.is_some(), "bobby never saw alice");
    assert_eq!(alice_seat.unwrap().channels[0].name, "gtr");
    let mut saw_userinfo_event = false;
    bobby.drain_events(|ev| {
        if ev == UiEvent::UserInfoChanged {
            saw_userinfo_event = true;
        }
    });
    assert!(saw_userinfo_event);

    // the decoded sine showed up after the interval boundary
    let onset = bobby_heard
        .iter()
        .position(|v| v.abs() > 0.05)
        .expect("bobby heard only silence");
    assert!(onset > 0, "audio cannot precede the first boundary");

    // a window well inside the played interval carries the sine at the right
    // level: RMS of a 0.5 amplitude sine is 0.3536
    let window = &bobby_heard[onset + 500..onset + 8500];
    let rms = (window.iter().map(|v| (*v as f64) * (*v as f64)).sum::<f64>()
        / window.len() as f64)
        .sqrt();
    let reference = (amp as f64) / f64::sqrt(2.0);
    assert!(
        (rms - reference).abs() <= 0.05,
        "rms {} too far from reference {}",
        rms,
        reference
    );

    // and it really is ~1 kHz: zero crossings per sample ~ 2f/sr
    let mut crossings = 0;
    for pair in window.windows(2) {
        if (pair[0] >= 0.0) != (pair[1] >= 0.0) {
            crossings += 1;
        }
    }
    let expected = 2.0 * 1000.0 * window.len() as f64 / SAMPLE_RATE as f64;
    assert!(
        (crossings as f64) > expected * 0.8 && (crossings as f64) < expected * 1.2,
        "{} crossings vs {} expected",
        crossings,
        expected
    );

    alice.deactivate();
    bobby.deactivate();
    stop.store(true, Ordering::Relaxed);
    let _ = room.join();
}
