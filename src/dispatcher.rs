// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client-side dispatcher: one send worker and one recv worker per connection.
//
// The send worker drains the outbound queue into the request region; the
// recv worker moves frames from the response region onto the inbound queue.
// The two share nothing but the queues, the channel and the stop flags.
// Sequence numbers are assigned at enqueue time under a single lock, so
// queue order and sequence order agree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::codec::{check_capacity, Command, RequestFrame, MAX_REQUEST_PAYLOAD};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::region::SharedChannel;

/// How often blocked workers re-check the stop flags.
const POLL: Duration = Duration::from_millis(20);

/// A reply as it came off the response region: `(sequence, payload)`.
pub type Inbound = (u32, Vec<u8>);

struct Outbound {
    sequence: u32,
    command: Command,
    payload: Vec<u8>,
}

struct SubmitState {
    next_sequence: u32,
    tx: Option<Sender<Outbound>>,
}

#[derive(Default)]
struct Flags {
    /// Shutdown has begun; blocked submitters give up.
    closing: AtomicBool,
    /// Workers must stop now.
    quit: AtomicBool,
    /// A worker hit a fatal channel error.
    closed: AtomicBool,
}

pub struct Dispatcher {
    channel: Arc<SharedChannel>,
    submit: Mutex<SubmitState>,
    flags: Arc<Flags>,
    send_worker: Mutex<Option<JoinHandle<()>>>,
    recv_worker: Mutex<Option<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl Dispatcher {
    /// Start both workers on `channel`. Returns the dispatcher and the
    /// receiving end of the inbound queue.
    pub fn start(channel: Arc<SharedChannel>, config: &Config) -> Result<(Self, Receiver<Inbound>)> {
        let (out_tx, out_rx) = bounded::<Outbound>(config.queue_depth);
        let (in_tx, in_rx) = bounded::<Inbound>(config.queue_depth);
        let flags = Arc::new(Flags::default());
        let tag: String = channel.client_id().chars().take(8).collect();

        let send_worker = {
            let channel = Arc::clone(&channel);
            let flags = Arc::clone(&flags);
            thread::Builder::new()
                .name(format!("capipc-send-{tag}"))
                .spawn(move || send_loop(&channel, out_rx, &flags))?
        };
        let recv_worker = {
            let channel = Arc::clone(&channel);
            let worker_flags = Arc::clone(&flags);
            let spawned = thread::Builder::new()
                .name(format!("capipc-recv-{tag}"))
                .spawn(move || recv_loop(&channel, in_tx, &worker_flags));
            match spawned {
                Ok(h) => h,
                Err(e) => {
                    flags.quit.store(true, Ordering::Release);
                    let _ = send_worker.join();
                    return Err(e.into());
                }
            }
        };

        let dispatcher = Self {
            channel,
            submit: Mutex::new(SubmitState {
                next_sequence: 1,
                tx: Some(out_tx),
            }),
            flags,
            send_worker: Mutex::new(Some(send_worker)),
            recv_worker: Mutex::new(Some(recv_worker)),
            drain_timeout: config.drain_timeout,
        };
        Ok((dispatcher, in_rx))
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    /// Enqueue a request and return its sequence number, waiting as long as
    /// the outbound queue stays full.
    ///
    /// Oversized payloads fail with `FrameTooLarge` before touching the queue.
    pub fn submit(&self, command: Command, payload: Vec<u8>) -> Result<u32> {
        self.submit_within(command, payload, None)
    }

    /// Like [`submit`](Self::submit), but gives up with `Timeout` if the
    /// queue is still full after `wait`. A request that timed out here was
    /// never queued and its sequence number is handed to the next caller.
    pub fn submit_within(&self, command: Command, payload: Vec<u8>, wait: Option<Duration>) -> Result<u32> {
        check_capacity(payload.len(), self.max_payload())?;
        let deadline = wait.map(|w| Instant::now() + w);

        let mut state = self.submit.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_stopping() {
            return Err(Error::ChannelClosed);
        }
        let sequence = state.next_sequence;
        let tx = state.tx.as_ref().ok_or(Error::ChannelClosed)?;
        let mut item = Outbound {
            sequence,
            command,
            payload,
        };
        loop {
            let slice = deadline.map_or(POLL, |dl| dl.saturating_duration_since(Instant::now()).min(POLL));
            match tx.send_timeout(item, slice) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.is_stopping() {
                        return Err(Error::ChannelClosed);
                    }
                    if deadline.is_some_and(|dl| Instant::now() >= dl) {
                        debug!(sequence, ?command, "outbound queue full, giving up");
                        return Err(Error::Timeout { sequence });
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(Error::ChannelClosed),
            }
        }
        state.next_sequence = sequence.wrapping_add(1).max(1);
        debug!(sequence, ?command, "request queued");
        Ok(sequence)
    }

    /// Largest request payload this channel can carry.
    pub fn max_payload(&self) -> usize {
        self.channel.request_capacity().min(MAX_REQUEST_PAYLOAD)
    }

    fn is_stopping(&self) -> bool {
        self.is_closed()
            || self.flags.closing.load(Ordering::Acquire)
            || self.flags.quit.load(Ordering::Acquire)
    }

    /// A worker failed; the connection is unusable.
    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }

    /// Whether both worker threads are still running.
    pub fn workers_alive(&self) -> bool {
        let running = |slot: &Mutex<Option<JoinHandle<()>>>| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|h| !h.is_finished())
        };
        running(&self.send_worker) && running(&self.recv_worker)
    }

    /// Stop accepting requests, let queued ones drain for up to the drain
    /// timeout, then stop and join both workers. Safe to call repeatedly and
    /// concurrently with callers blocked on replies.
    pub fn shutdown(&self) {
        self.flags.closing.store(true, Ordering::Release);
        drop(self.submit.lock().unwrap_or_else(PoisonError::into_inner).tx.take());

        let send = self.send_worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = &send {
            let deadline = Instant::now() + self.drain_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.flags.quit.store(true, Ordering::Release);

        let recv = self.recv_worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        for handle in [send, recv].into_iter().flatten() {
            if handle.join().is_err() {
                warn!(client = %self.channel.client_id(), "dispatcher worker panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fail(channel: &SharedChannel, flags: &Flags, worker: &str, err: &Error) {
    error!(client = %channel.client_id(), worker, error = %err, "channel failed");
    flags.closed.store(true, Ordering::Release);
    flags.quit.store(true, Ordering::Release);
    channel.unlink();
}

fn send_loop(channel: &SharedChannel, rx: Receiver<Outbound>, flags: &Flags) {
    while !flags.quit.load(Ordering::Acquire) {
        let item = match rx.recv_timeout(POLL) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let frame = RequestFrame {
            sequence: item.sequence,
            command: item.command,
            payload: item.payload,
        };
        loop {
            match channel.send_request(&frame, Some(POLL)) {
                Ok(true) => {
                    debug!(sequence = frame.sequence, command = ?frame.command, "request written");
                    break;
                }
                Ok(false) if flags.quit.load(Ordering::Acquire) => return,
                Ok(false) => {}
                Err(Error::FrameTooLarge { size, capacity }) => {
                    warn!(sequence = frame.sequence, size, capacity, "dropping oversized request");
                    break;
                }
                Err(e) => return fail(channel, flags, "send", &e),
            }
        }
    }
}

fn recv_loop(channel: &SharedChannel, tx: Sender<Inbound>, flags: &Flags) {
    while !flags.quit.load(Ordering::Acquire) {
        let frame = match channel.recv_response(Some(POLL)) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(Error::Protocol(msg)) => {
                warn!(client = %channel.client_id(), %msg, "dropping malformed response");
                continue;
            }
            Err(e) => return fail(channel, flags, "recv", &e),
        };
        debug!(sequence = frame.sequence, len = frame.payload.len(), "response read");
        let mut item = (frame.sequence, frame.payload);
        loop {
            match tx.send_timeout(item, POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) if !flags.quit.load(Ordering::Acquire) => {
                    item = back
                }
                Err(_) => return,
            }
        }
    }
}
