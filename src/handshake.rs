// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Rendezvous handshake over a short-lived TCP connection.
//
//   client → daemon   id            (client proposes a name)
//   daemon            creates <id>_res region + semaphore
//   daemon → client   id            (echo: response region is ready)
//   client            opens <id>_res, creates <id>_req region + semaphore
//   client → daemon   id            (commit: request region is ready)
//   daemon            opens <id>_req
//
// Only the id crosses the socket. Any mismatch or timeout aborts and drops
// whatever was created so far, which unlinks it.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::region::{self, Side, SharedChannel};

/// Raw length of a client id in bytes.
pub const CLIENT_ID_LEN: usize = 16;
/// Length of the hex form that travels on the socket and names resources.
pub const CLIENT_ID_HEX_LEN: usize = CLIENT_ID_LEN * 2;

/// Random per-connection identifier naming the connection's OS resources.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    pub fn random() -> Self {
        let mut raw = [0u8; CLIENT_ID_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(raw)
    }

    pub fn from_bytes(raw: [u8; CLIENT_ID_LEN]) -> Self {
        Self(raw)
    }

    /// Parse the 32-character hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut raw = [0u8; CLIENT_ID_LEN];
        hex::decode_to_slice(s, &mut raw)
            .map_err(|e| Error::handshake(format!("invalid client id {s:?}: {e}")))?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }

    /// Lowercase hex form used on the wire and in resource names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.to_hex())
    }
}

fn step<T>(what: &str, r: io::Result<T>) -> Result<T> {
    r.map_err(|e| match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            Error::handshake(format!("{what}: timed out"))
        }
        _ => Error::handshake(format!("{what}: {e}")),
    })
}

fn prepare(stream: &TcpStream, timeout: Duration) -> Result<()> {
    step("socket setup", stream.set_read_timeout(Some(timeout)))?;
    step("socket setup", stream.set_write_timeout(Some(timeout)))?;
    step("socket setup", stream.set_nodelay(true))
}

fn read_id(stream: &mut TcpStream, what: &str) -> Result<String> {
    let mut buf = [0u8; CLIENT_ID_HEX_LEN];
    step(what, stream.read_exact(&mut buf))?;
    String::from_utf8(buf.to_vec()).map_err(|_| Error::handshake(format!("{what}: id is not text")))
}

/// Client side: connect to the daemon with a fresh id.
pub fn connect(config: &Config) -> Result<SharedChannel> {
    connect_with_id(config, ClientId::random())
}

/// Client side with a caller-chosen id.
pub fn connect_with_id(config: &Config, id: ClientId) -> Result<SharedChannel> {
    let addr = step("resolve", config.bootstrap_addr().to_socket_addrs())?
        .next()
        .ok_or_else(|| Error::handshake(format!("no address for {}", config.bootstrap_addr())))?;
    let mut stream = step("connect", TcpStream::connect_timeout(&addr, config.handshake_timeout))?;
    prepare(&stream, config.handshake_timeout)?;

    let hex_id = id.to_hex();
    debug!(client = %hex_id, %addr, "handshake: proposing id");
    step("send id", stream.write_all(hex_id.as_bytes()))?;

    let echo = read_id(&mut stream, "await echo")?;
    if echo != hex_id {
        return Err(Error::handshake(format!("echo mismatch: sent {hex_id}, got {echo}")));
    }

    let response = step("open response region", region::open_response_region(&hex_id))?;
    let request = step(
        "create request region",
        region::create_request_region(&hex_id, config.request_capacity),
    )?;

    step("send commit", stream.write_all(hex_id.as_bytes()))?;
    drop(stream);

    info!(client = %hex_id, "connected");
    Ok(SharedChannel::new(&hex_id, Side::Client, request, response))
}

/// Daemon side: run the handshake on an accepted bootstrap connection.
pub fn accept(mut stream: TcpStream, config: &Config) -> Result<SharedChannel> {
    prepare(&stream, config.handshake_timeout)?;

    let proposed = read_id(&mut stream, "await id")?;
    let id = ClientId::from_hex(&proposed)?.to_hex();
    if id != proposed {
        return Err(Error::handshake(format!("client id {proposed:?} is not lowercase hex")));
    }
    debug!(client = %id, "handshake: creating response region");

    let response = step(
        "create response region",
        region::create_response_region(&id, config.response_capacity),
    )?;
    step("send echo", stream.write_all(id.as_bytes()))?;

    let commit = read_id(&mut stream, "await commit")?;
    if commit != id {
        return Err(Error::handshake(format!("commit mismatch: expected {id}, got {commit}")));
    }
    let request = step("open request region", region::open_request_region(&id))?;

    info!(client = %id, "client attached");
    Ok(SharedChannel::new(&id, Side::Daemon, request, response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_32_hex_chars() {
        let id = ClientId::random();
        let s = id.to_hex();
        assert_eq!(s.len(), CLIENT_ID_HEX_LEN);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(ClientId::from_hex(&s).unwrap(), id);
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(ClientId::random(), ClientId::random());
    }

    #[test]
    fn bad_hex_is_handshake_error() {
        assert!(matches!(ClientId::from_hex("zz"), Err(Error::HandshakeFailed(_))));
        assert!(matches!(ClientId::from_hex("abcd"), Err(Error::HandshakeFailed(_))));
    }
}
