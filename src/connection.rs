// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One connected channel with its dispatcher and correlator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cleanup;
use crate::codec::Command;
use crate::config::Config;
use crate::correlator::Correlator;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::handshake;
use crate::region::SharedChannel;

/// Client end of a capability transport connection.
///
/// All methods take `&self`; a `Connection` is meant to be shared behind an
/// `Arc` by every proxy created on it.
pub struct Connection {
    channel: Arc<SharedChannel>,
    dispatcher: Dispatcher,
    correlator: Correlator,
    config: Config,
    closed: AtomicBool,
}

impl Connection {
    /// Run the rendezvous handshake and start the workers.
    pub fn open(config: Config) -> Result<Self> {
        let channel = handshake::connect(&config)?;
        Self::attach(channel, config)
    }

    /// Start the workers on an already established channel.
    pub fn attach(channel: SharedChannel, config: Config) -> Result<Self> {
        let channel = Arc::new(channel);
        if let Err(e) = cleanup::track(channel.client_id()) {
            warn!(client = %channel.client_id(), error = %e, "signal cleanup unavailable");
        }
        let (dispatcher, inbound) = match Dispatcher::start(Arc::clone(&channel), &config) {
            Ok(started) => started,
            Err(e) => {
                cleanup::untrack(channel.client_id());
                channel.unlink();
                return Err(e);
            }
        };
        Ok(Self {
            channel,
            dispatcher,
            correlator: Correlator::new(inbound),
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &str {
        self.channel.client_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.dispatcher.is_closed()
    }

    /// Enqueue a request and return its sequence number without waiting for
    /// a reply. A full outbound queue is waited on for at most the call
    /// timeout.
    pub fn request(&self, command: Command, payload: Vec<u8>) -> Result<u32> {
        self.request_within(command, payload, self.config.call_timeout)
    }

    /// Enqueue a request, waiting at most `wait` for room in the outbound
    /// queue. `None` waits until the connection closes.
    pub fn request_within(&self, command: Command, payload: Vec<u8>, wait: Option<Duration>) -> Result<u32> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        self.dispatcher.submit_within(command, payload, wait)
    }

    /// Wait for the reply to `sequence`. `None` waits forever.
    pub fn await_response(&self, sequence: u32, timeout: Option<Duration>) -> Result<Value> {
        self.correlator.await_response(sequence, timeout)
    }

    /// Non-blocking check for the reply to `sequence`.
    pub fn poll_response(&self, sequence: u32) -> Result<Option<Value>> {
        self.correlator.poll(sequence)
    }

    /// Send and, if the command is answered, wait for the reply.
    /// Commands without a reply return `Value::Null` once queued.
    ///
    /// `timeout` covers both the wait for queue room and the wait for the
    /// reply.
    pub fn call(&self, command: Command, payload: Vec<u8>, timeout: Option<Duration>) -> Result<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let sequence = self.request_within(command, payload, timeout)?;
        if !command.expects_reply() {
            return Ok(Value::Null);
        }
        let remaining = deadline.map(|dl| dl.saturating_duration_since(Instant::now()));
        self.await_response(sequence, remaining)
    }

    /// Liveness probe: both workers running and an `ALIVE` round trip
    /// completing within the configured alive timeout.
    pub fn is_alive(&self) -> bool {
        if self.is_closed() || !self.dispatcher.workers_alive() {
            return false;
        }
        match self.call(Command::Alive, Vec::new(), Some(self.config.alive_timeout)) {
            Ok(_) => true,
            Err(e) => {
                debug!(client = %self.client_id(), error = %e, "alive check failed");
                false
            }
        }
    }

    /// Stop the workers, then unlink all four named resources.
    ///
    /// Idempotent; safe while other threads are blocked on replies (they
    /// observe `ChannelClosed`).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.shutdown();
        let dropped = self.correlator.clear();
        if dropped > 0 {
            debug!(client = %self.client_id(), dropped, "discarded unclaimed replies");
        }
        self.channel.unlink();
        cleanup::untrack(self.client_id());
        info!(client = %self.client_id(), "disconnected");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
