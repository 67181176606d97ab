//! TCP transport for the protocol engine.
//!
//! The worker owns the stream.  Reads use a short timeout so one engine tick
//! never camps on the socket; writes are small and go out blocking.  Framing
//! and payload decode live in [`super::wire`]; this layer just moves bytes
//! and maps unknown message types to a skip instead of a failure so newer
//! servers don't knock us over.
use log::{debug, warn};
use num::FromPrimitive;
use sha1::{Digest, Sha1};
use simple_error::bail;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::common::box_error::BoxError;

use super::wire::{ClientMessage, FrameReader, MessageType, ServerMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_millis(5);

/// compute the auth proof for client-auth-user:
/// `SHA1( SHA1(user ":" pass) ++ challenge )`
pub fn password_hash(user: &str, pass: &str, challenge: &[u8; 8]) -> [u8; 20] {
    let mut inner = Sha1::new();
    inner.update(user.as_bytes());
    inner.update(b":");
    inner.update(pass.as_bytes());
    let inner = inner.finalize();
    let mut outer = Sha1::new();
    outer.update(inner);
    outer.update(challenge);
    outer.finalize().into()
}

pub struct Connection {
    stream: TcpStream,
    framer: FrameReader,
    scratch: [u8; 4096],
}

impl Connection {
    /// resolve `host:port` and open the stream
    pub fn open(server: &str) -> Result<Connection, BoxError> {
        let mut addrs = server.to_socket_addrs()?;
        let addr = match addrs.next() {
            Some(a) => a,
            None => bail!("no address for {}", server),
        };
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        debug!("connected to {}", addr);
        Ok(Connection {
            stream,
            framer: FrameReader::new(),
            scratch: [0; 4096],
        })
    }

    /// Pull at most one message off the stream.  `Ok(None)` means nothing
    /// complete arrived yet.  Unknown message types are skipped.
    pub fn poll_message(&mut self) -> Result<Option<ServerMessage>, BoxError> {
        loop {
            if let Some((msg_type, payload)) = self.framer.next_frame()? {
                match MessageType::from_u8(msg_type) {
                    Some(_) => return Ok(Some(ServerMessage::decode(msg_type, &payload)?)),
                    None => {
                        debug!("skipping unknown message type 0x{:02x}", msg_type);
                        continue;
                    }
                }
            }
            match self.stream.read(&mut self.scratch) {
                Ok(0) => bail!("server closed connection"),
                Ok(n) => {
                    self.framer.push_bytes(&self.scratch[..n]);
                    // loop around to try the framer again
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn send(&mut self, msg: &ClientMessage) -> Result<(), BoxError> {
        self.stream.write_all(&msg.encode())?;
        Ok(())
    }

    /// best effort shutdown; errors here don't matter, we're leaving
    pub fn close(&mut self) -> () {
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                warn!("socket shutdown: {}", e);
            }
        }
    }
}
