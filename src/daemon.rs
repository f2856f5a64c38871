// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Daemon half of the transport.
//
// The accept loop runs the rendezvous for each client and starts a session:
// a recv worker that reads request frames and invokes capabilities inline,
// and a send worker that writes the replies. Registrations live in the recv
// worker and die with the session.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use rand::RngCore;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::chain::ref_index;
use crate::codec::{
    decode_payload, encode_payload, CallPayload, ChainPayload, Command, NamePayload, Reply,
    RequestFrame, ResponseFrame,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::handshake;
use crate::region::SharedChannel;
use crate::schema::{CapabilitySpec, MethodSpec};
use crate::shm::ShmHandle;

const POLL: Duration = Duration::from_millis(20);
/// How often an idle session checks that its client still exists.
const PEER_CHECK: Duration = Duration::from_secs(1);

/// A privileged implementation served to clients.
pub trait Capability: Send + Sync {
    /// Declared methods; the daemon adds a fresh signature per registration.
    fn methods(&self) -> BTreeMap<String, MethodSpec>;

    /// Run `method`. `Err` carries a message for the client.
    fn invoke(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, String>;
}

/// Capabilities the daemon offers, by name.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, capability: impl Capability + 'static) -> Self {
        self.insert(name, Arc::new(capability));
        self
    }

    pub fn insert(&mut self, name: &str, capability: Arc<dyn Capability>) {
        self.entries.insert(name.to_string(), capability);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

struct Session {
    channel: Arc<SharedChannel>,
    quit: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Session {
    fn is_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }

    fn stop(self) {
        self.quit.store(true, Ordering::Release);
        for w in self.workers {
            if w.join().is_err() {
                warn!(client = %self.channel.client_id(), "session worker panicked");
            }
        }
        self.channel.unlink();
    }
}

struct Shared {
    stop: AtomicBool,
    sessions: Mutex<Vec<Session>>,
    frames: [AtomicU64; Command::ALL.len()],
}

impl Shared {
    fn count(&self, command: Command) {
        self.frames[command as usize].fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Daemon {
    listener: TcpListener,
    config: Config,
    registry: Arc<CapabilityRegistry>,
    shared: Arc<Shared>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Bind the bootstrap listener. Port 0 picks an ephemeral port.
    pub fn bind(config: Config, registry: CapabilityRegistry) -> Result<Self> {
        let listener = TcpListener::bind(config.bootstrap_addr())?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "daemon listening");
        Ok(Self {
            listener,
            config,
            registry: Arc::new(registry),
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                sessions: Mutex::new(Vec::new()),
                frames: Default::default(),
            }),
            acceptor: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.local_addr()?.port())
    }

    /// Start the accept loop on a background thread. Calling it again
    /// while it runs does nothing.
    pub fn serve(&self) -> Result<()> {
        let mut acceptor = self.acceptor.lock().unwrap_or_else(PoisonError::into_inner);
        if acceptor.is_some() {
            return Ok(());
        }
        let listener = self.listener.try_clone()?;
        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let shared = Arc::clone(&self.shared);
        *acceptor = Some(
            thread::Builder::new()
                .name("capipc-accept".into())
                .spawn(move || accept_loop(listener, &config, &registry, &shared))?,
        );
        Ok(())
    }

    /// Block the calling thread until `stop` is called from elsewhere.
    pub fn wait(&self) {
        while !self.shared.stop.load(Ordering::Acquire) {
            thread::sleep(POLL);
        }
    }

    /// Stop accepting, stop every session and unlink its resources.
    /// Idempotent.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.acceptor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if handle.join().is_err() {
                warn!("accept loop panicked");
            }
        }
        let sessions = std::mem::take(&mut *self.shared.sessions.lock().unwrap_or_else(PoisonError::into_inner));
        for s in sessions {
            s.stop();
        }
    }

    /// Frames of `command` received across all sessions.
    pub fn frame_count(&self, command: Command) -> u64 {
        self.shared.frames[command as usize].load(Ordering::Relaxed)
    }

    /// Sessions whose workers are still running.
    pub fn session_count(&self) -> usize {
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| !s.is_finished())
            .count()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, config: &Config, registry: &Arc<CapabilityRegistry>, shared: &Arc<Shared>) {
    while !shared.stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "bootstrap connection");
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "dropping bootstrap connection");
                    continue;
                }
                match handshake::accept(stream, config) {
                    Ok(channel) => start_session(channel, config, registry, shared),
                    Err(e) => warn!(%peer, error = %e, "handshake failed"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL),
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(POLL);
            }
        }
        reap(shared);
    }
}

/// Drop sessions that ended on their own.
fn reap(shared: &Shared) {
    let finished: Vec<Session> = {
        let mut sessions = shared.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let (done, live): (Vec<Session>, Vec<Session>) = std::mem::take(&mut *sessions).into_iter().partition(Session::is_finished);
        *sessions = live;
        done
    };
    for s in finished {
        s.stop();
    }
}

fn start_session(channel: SharedChannel, config: &Config, registry: &Arc<CapabilityRegistry>, shared: &Arc<Shared>) {
    let channel = Arc::new(channel);
    let quit = Arc::new(AtomicBool::new(false));
    let (tx, rx) = bounded::<ResponseFrame>(config.queue_depth);
    let tag: String = channel.client_id().chars().take(8).collect();

    let sender = {
        let channel = Arc::clone(&channel);
        let quit = Arc::clone(&quit);
        thread::Builder::new()
            .name(format!("capipc-dsend-{tag}"))
            .spawn(move || send_loop(&channel, rx, &quit))
    };
    let sender = match sender {
        Ok(h) => h,
        Err(e) => {
            error!(client = %channel.client_id(), error = %e, "cannot start session");
            channel.unlink();
            return;
        }
    };
    let receiver = {
        let channel = Arc::clone(&channel);
        let quit = Arc::clone(&quit);
        let registry = Arc::clone(registry);
        let shared = Arc::clone(shared);
        thread::Builder::new()
            .name(format!("capipc-drecv-{tag}"))
            .spawn(move || recv_loop(&channel, tx, &quit, &registry, &shared))
    };
    let mut workers = vec![sender];
    match receiver {
        Ok(h) => workers.push(h),
        Err(e) => {
            error!(client = %channel.client_id(), error = %e, "cannot start session");
            Session { channel, quit, workers }.stop();
            return;
        }
    }
    info!(client = %channel.client_id(), "session started");
    shared
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Session { channel, quit, workers });
}

fn send_loop(channel: &SharedChannel, rx: Receiver<ResponseFrame>, quit: &AtomicBool) {
    loop {
        let frame = match rx.recv_timeout(POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) if quit.load(Ordering::Acquire) => return,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        loop {
            match channel.send_response(&frame, Some(POLL)) {
                Ok(true) => break,
                Ok(false) if quit.load(Ordering::Acquire) => return,
                Ok(false) => {}
                Err(Error::FrameTooLarge { size, capacity }) => {
                    warn!(sequence = frame.sequence, size, capacity, "reply too large, sending error");
                    let msg = format!("reply of {size} bytes exceeds response capacity of {capacity} bytes");
                    let Ok(payload) = encode_payload(&Reply::Err(msg)) else {
                        break;
                    };
                    let fallback = ResponseFrame {
                        sequence: frame.sequence,
                        payload,
                    };
                    if let Err(e) = channel.send_response(&fallback, None) {
                        error!(client = %channel.client_id(), error = %e, "send worker failed");
                        quit.store(true, Ordering::Release);
                        return;
                    }
                    break;
                }
                Err(e) => {
                    error!(client = %channel.client_id(), error = %e, "send worker failed");
                    quit.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }
}

fn recv_loop(
    channel: &SharedChannel,
    tx: Sender<ResponseFrame>,
    quit: &AtomicBool,
    registry: &CapabilityRegistry,
    shared: &Shared,
) {
    let mut handler = Handler {
        registry,
        registrations: HashMap::new(),
    };
    let mut last_check = Instant::now();
    while !quit.load(Ordering::Acquire) {
        let frame = match channel.recv_request(Some(POLL)) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if last_check.elapsed() >= PEER_CHECK {
                    last_check = Instant::now();
                    if !peer_present(channel) {
                        info!(client = %channel.client_id(), "client gone, ending session");
                        break;
                    }
                }
                continue;
            }
            Err(Error::Protocol(msg)) => {
                warn!(client = %channel.client_id(), %msg, "dropping malformed request");
                continue;
            }
            Err(e) => {
                error!(client = %channel.client_id(), error = %e, "recv worker failed");
                break;
            }
        };
        shared.count(frame.command);
        debug!(sequence = frame.sequence, command = ?frame.command, len = frame.payload.len(), "request");

        let Some(reply) = handler.handle(&frame) else {
            continue;
        };
        let payload = match encode_payload(&reply) {
            Ok(p) => p,
            Err(e) => {
                warn!(sequence = frame.sequence, error = %e, "cannot encode reply");
                continue;
            }
        };
        let mut item = ResponseFrame {
            sequence: frame.sequence,
            payload,
        };
        loop {
            match tx.send_timeout(item, POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) if !quit.load(Ordering::Acquire) => item = back,
                Err(_) => {
                    quit.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }
    quit.store(true, Ordering::Release);
    debug!(client = %channel.client_id(), registrations = handler.registrations.len(), "session ended");
}

fn peer_present(channel: &SharedChannel) -> bool {
    match ShmHandle::exists(channel.request_region().name()) {
        Ok(present) => present,
        Err(e) => {
            warn!(client = %channel.client_id(), error = %e, "peer check failed");
            true
        }
    }
}

struct Registration {
    name: String,
    capability: Arc<dyn Capability>,
}

/// Per-session request handling. Returns the reply, if the command has one.
struct Handler<'a> {
    registry: &'a CapabilityRegistry,
    registrations: HashMap<String, Registration>,
}

impl Handler<'_> {
    fn handle(&mut self, frame: &RequestFrame) -> Option<Reply> {
        let result = match frame.command {
            Command::Alive => Ok(Value::Null),
            Command::Register => decode_payload::<NamePayload>(&frame.payload)
                .map_err(|e| e.to_string())
                .and_then(|p| self.register(&p.name)),
            Command::Unregister => {
                match decode_payload::<NamePayload>(&frame.payload) {
                    Ok(p) => self.unregister(&p.name),
                    Err(e) => warn!(sequence = frame.sequence, error = %e, "bad unregister payload"),
                }
                return None;
            }
            Command::Call => self.call(&frame.payload),
            Command::OneWay => {
                if let Err(msg) = self.call(&frame.payload) {
                    warn!(sequence = frame.sequence, %msg, "one-way call failed");
                }
                return None;
            }
            Command::ChainCall => self.chain(&frame.payload),
        };
        Some(result.into())
    }

    fn register(&mut self, name: &str) -> std::result::Result<Value, String> {
        let capability = self
            .registry
            .get(name)
            .ok_or_else(|| format!("unknown capability `{name}`"))?;
        let mut raw = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut raw);
        let signature = hex::encode(raw);
        let spec = CapabilitySpec {
            signature: signature.clone(),
            methods: capability.methods(),
        };
        info!(capability = name, %signature, "registered");
        self.registrations.insert(
            signature,
            Registration {
                name: name.to_string(),
                capability,
            },
        );
        serde_json::to_value(spec).map_err(|e| e.to_string())
    }

    fn unregister(&mut self, name: &str) {
        let before = self.registrations.len();
        self.registrations.retain(|_, r| r.name != name);
        info!(capability = name, dropped = before - self.registrations.len(), "unregistered");
    }

    fn invoke(&self, signature: &str, method: &str, args: Vec<Value>) -> std::result::Result<Value, String> {
        let reg = self
            .registrations
            .get(signature)
            .ok_or_else(|| format!("no registration with signature `{signature}`"))?;
        reg.capability.invoke(method, args)
    }

    fn call(&self, payload: &[u8]) -> std::result::Result<Value, String> {
        let p: CallPayload = decode_payload(payload).map_err(|e| e.to_string())?;
        self.invoke(&p.signature, &p.method, p.args)
    }

    /// Run the steps in order, replacing `{"$ref": n}` arguments with the
    /// result of step `n`. Replies with the last result.
    fn chain(&self, payload: &[u8]) -> std::result::Result<Value, String> {
        let p: ChainPayload = decode_payload(payload).map_err(|e| e.to_string())?;
        let mut results: Vec<Value> = Vec::with_capacity(p.table.len());
        for (i, row) in p.table.into_iter().enumerate() {
            let args = row
                .2
                .into_iter()
                .map(|a| match ref_index(&a) {
                    Some(n) => results
                        .get(n)
                        .cloned()
                        .ok_or_else(|| format!("step {i} references step {n}, which has not run")),
                    None => Ok(a),
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let value = self
                .invoke(&row.0, &row.1, args)
                .map_err(|msg| format!("step {i} ({}): {msg}", row.1))?;
            results.push(value);
        }
        Ok(results.pop().unwrap_or(Value::Null))
    }
}
