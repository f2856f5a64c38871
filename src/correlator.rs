// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Matches inbound replies to waiting callers by sequence number.
//
// Any waiter may drain the inbound queue. Replies for someone else are
// parked in `pending`, which every waiter re-checks between short receive
// slices, so replies can arrive in any order.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde_json::Value;
use tracing::{debug, warn};

use crate::codec::decode_reply;
use crate::dispatcher::Inbound;
use crate::error::{Error, Result};

/// Longest a waiter blocks on the queue before re-checking `pending`.
const SLICE: Duration = Duration::from_millis(5);

/// Parked replies kept without a waiter; beyond this the lowest sequence
/// is evicted.
pub const PENDING_LIMIT: usize = 4096;

pub struct Correlator {
    inbound: Receiver<Inbound>,
    pending: Mutex<HashMap<u32, Vec<u8>>>,
}

impl Correlator {
    pub fn new(inbound: Receiver<Inbound>) -> Self {
        Self {
            inbound,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn take(&self, sequence: u32) -> Option<Vec<u8>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sequence)
    }

    fn stash(&self, sequence: u32, payload: Vec<u8>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.insert(sequence, payload).is_some() {
            debug!(sequence, "duplicate reply replaced");
            return;
        }
        if pending.len() > PENDING_LIMIT {
            if let Some(&oldest) = pending.keys().min() {
                pending.remove(&oldest);
                warn!(sequence = oldest, "evicted unclaimed reply");
            }
        }
    }

    /// Number of replies parked without a waiter.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop every parked reply and return how many there were.
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let n = pending.len();
        pending.clear();
        n
    }

    /// Wait for the raw payload of `sequence`. `None` waits forever.
    ///
    /// On `Timeout` the request is not retracted; a late reply is parked and
    /// a later call for the same sequence still finds it.
    pub fn await_raw(&self, sequence: u32, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(payload) = self.take(sequence) {
                return Ok(payload);
            }
            let slice = match deadline {
                Some(dl) => {
                    let remaining = dl.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Timeout { sequence });
                    }
                    remaining.min(SLICE)
                }
                None => SLICE,
            };
            match self.inbound.recv_timeout(slice) {
                Ok((seq, payload)) if seq == sequence => return Ok(payload),
                Ok((seq, payload)) => self.stash(seq, payload),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return self.take(sequence).ok_or(Error::ChannelClosed);
                }
            }
        }
    }

    /// Wait for `sequence` and decode its reply envelope.
    pub fn await_response(&self, sequence: u32, timeout: Option<Duration>) -> Result<Value> {
        decode_reply(&self.await_raw(sequence, timeout)?)
    }

    /// Non-blocking check: drain whatever is queued, then look for `sequence`.
    pub fn poll(&self, sequence: u32) -> Result<Option<Value>> {
        loop {
            match self.inbound.try_recv() {
                Ok((seq, payload)) => self.stash(seq, payload),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return match self.take(sequence) {
                        Some(p) => decode_reply(&p).map(Some),
                        None => Err(Error::ChannelClosed),
                    };
                }
            }
        }
        self.take(sequence).map(|p| decode_reply(&p)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn ok(v: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({ "ok": v })).unwrap()
    }

    #[test]
    fn out_of_order_replies_reach_their_waiters() {
        let (tx, rx) = unbounded();
        let c = Arc::new(Correlator::new(rx));

        let ca = Arc::clone(&c);
        let a = thread::spawn(move || ca.await_response(1, Some(Duration::from_secs(2))));
        let cb = Arc::clone(&c);
        let b = thread::spawn(move || cb.await_response(2, Some(Duration::from_secs(2))));

        tx.send((2, ok(json!("B")))).unwrap();
        thread::sleep(Duration::from_millis(20));
        tx.send((1, ok(json!("A")))).unwrap();

        assert_eq!(a.join().unwrap().unwrap(), json!("A"));
        assert_eq!(b.join().unwrap().unwrap(), json!("B"));
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn early_reply_is_parked_until_asked_for() {
        let (tx, rx) = unbounded();
        let c = Correlator::new(rx);
        tx.send((7, ok(json!(7)))).unwrap();
        tx.send((8, ok(json!(8)))).unwrap();
        assert_eq!(c.await_response(8, Some(Duration::from_millis(200))).unwrap(), json!(8));
        assert_eq!(c.pending_len(), 1);
        assert_eq!(c.await_response(7, Some(Duration::ZERO)).unwrap(), json!(7));
    }

    #[test]
    fn timeout_then_late_reply_is_still_cached() {
        let (tx, rx) = unbounded();
        let c = Correlator::new(rx);
        let start = Instant::now();
        assert!(matches!(
            c.await_response(3, Some(Duration::from_millis(30))),
            Err(Error::Timeout { sequence: 3 })
        ));
        assert!(start.elapsed() >= Duration::from_millis(30));

        tx.send((3, ok(json!("late")))).unwrap();
        assert_eq!(c.poll(3).unwrap(), Some(json!("late")));
    }

    #[test]
    fn duplicate_reply_is_harmless() {
        let (tx, rx) = unbounded();
        let c = Correlator::new(rx);
        tx.send((4, ok(json!(1)))).unwrap();
        tx.send((4, ok(json!(1)))).unwrap();
        assert_eq!(c.poll(5).unwrap(), None);
        assert_eq!(c.pending_len(), 1);
        assert_eq!(c.poll(4).unwrap(), Some(json!(1)));
    }

    #[test]
    fn unclaimed_replies_are_bounded_and_clearable() {
        let (tx, rx) = unbounded();
        let c = Correlator::new(rx);
        for seq in 1..=(PENDING_LIMIT as u32 + 1) {
            tx.send((seq, ok(json!(seq)))).unwrap();
        }
        assert_eq!(c.poll(0).unwrap(), None);
        assert_eq!(c.pending_len(), PENDING_LIMIT);
        assert_eq!(c.poll(1).unwrap(), None);
        assert_eq!(c.poll(2).unwrap(), Some(json!(2)));

        assert_eq!(c.clear(), PENDING_LIMIT - 1);
        assert_eq!(c.pending_len(), 0);
        assert_eq!(c.poll(PENDING_LIMIT as u32 + 1).unwrap(), None);
    }

    #[test]
    fn closed_queue_is_channel_closed() {
        let (tx, rx) = unbounded::<Inbound>();
        let c = Correlator::new(rx);
        drop(tx);
        assert!(matches!(c.await_response(1, None), Err(Error::ChannelClosed)));
        assert!(matches!(c.poll(1), Err(Error::ChannelClosed)));
    }

    #[test]
    fn remote_error_passes_through() {
        let (tx, rx) = unbounded();
        let c = Correlator::new(rx);
        tx.send((1, br#"{"err":"denied"}"#.to_vec())).unwrap();
        match c.await_response(1, Some(Duration::from_millis(100))) {
            Err(Error::RemoteError(msg)) => assert_eq!(msg, "denied"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
