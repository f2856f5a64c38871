// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Dispatcher and correlator over a real shared channel, with a scripted
// daemon side driven from the test.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use capipc::codec::{Command, RequestFrame, ResponseFrame};
use capipc::region::{self, SharedChannel, Side};
use capipc::{Config, Connection, Correlator, Dispatcher, Error};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{}x{n}", std::process::id())
}

fn channel_pair(req_cap: usize) -> (SharedChannel, SharedChannel) {
    let id = unique_name("dp");
    let daemon_res = region::create_response_region(&id, 4096).expect("create res");
    let client_res = region::open_response_region(&id).expect("open res");
    let client_req = region::create_request_region(&id, req_cap).expect("create req");
    let daemon_req = region::open_request_region(&id).expect("open req");
    (
        SharedChannel::new(&id, Side::Client, client_req, client_res),
        SharedChannel::new(&id, Side::Daemon, daemon_req, daemon_res),
    )
}

fn start(client: SharedChannel) -> (Dispatcher, Correlator) {
    let (d, inbound) = Dispatcher::start(Arc::new(client), &Config::default()).expect("start");
    (d, Correlator::new(inbound))
}

fn read_n(daemon: &SharedChannel, n: usize) -> Vec<RequestFrame> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut frames = Vec::new();
    while frames.len() < n && Instant::now() < deadline {
        if let Some(f) = daemon.recv_request(Some(Duration::from_millis(50))).unwrap() {
            frames.push(f);
        }
    }
    frames
}

fn reply(daemon: &SharedChannel, sequence: u32, value: serde_json::Value) {
    let frame = ResponseFrame {
        sequence,
        payload: serde_json::to_vec(&json!({ "ok": value })).unwrap(),
    };
    assert!(daemon.send_response(&frame, Some(Duration::from_secs(2))).unwrap());
}

#[test]
fn sequences_are_monotonic_under_concurrent_callers() {
    let (client, daemon) = channel_pair(256);
    let (dispatcher, _correlator) = start(client);
    let dispatcher = Arc::new(dispatcher);

    let threads = 4;
    let per_thread = 50;
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let d = Arc::clone(&dispatcher);
            thread::spawn(move || {
                (0..per_thread)
                    .map(|_| d.submit(Command::OneWay, b"{}".to_vec()).unwrap())
                    .collect::<Vec<u32>>()
            })
        })
        .collect();

    let frames = read_n(&daemon, threads * per_thread);
    let mut all = HashSet::new();
    for h in handles {
        let seqs = h.join().unwrap();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "per-caller order: {seqs:?}");
        all.extend(seqs);
    }
    assert_eq!(all.len(), threads * per_thread);
    assert_eq!(all.iter().min(), Some(&1));

    // Queue order is sequence order, so the daemon sees them ascending.
    let seen: Vec<u32> = frames.iter().map(|f| f.sequence).collect();
    assert_eq!(seen.len(), threads * per_thread);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn out_of_order_replies_reach_the_right_caller() {
    let (client, daemon) = channel_pair(256);
    let (dispatcher, correlator) = start(client);
    let correlator = Arc::new(correlator);

    let a = dispatcher.submit(Command::Call, br#"{"who":"A"}"#.to_vec()).unwrap();
    let b = dispatcher.submit(Command::Call, br#"{"who":"B"}"#.to_vec()).unwrap();
    assert!(b > a);

    let ca = Arc::clone(&correlator);
    let wait_a = thread::spawn(move || ca.await_response(a, Some(Duration::from_secs(5))));
    let cb = Arc::clone(&correlator);
    let wait_b = thread::spawn(move || cb.await_response(b, Some(Duration::from_secs(5))));

    let frames = read_n(&daemon, 2);
    assert_eq!(frames.len(), 2);
    reply(&daemon, b, json!("B"));
    reply(&daemon, a, json!("A"));

    assert_eq!(wait_a.join().unwrap().unwrap(), json!("A"));
    assert_eq!(wait_b.join().unwrap().unwrap(), json!("B"));
}

#[test]
fn timed_out_reply_is_still_delivered_later() {
    let (client, daemon) = channel_pair(256);
    let (dispatcher, correlator) = start(client);

    let seq = dispatcher.submit(Command::Call, b"{}".to_vec()).unwrap();
    assert!(matches!(
        correlator.await_response(seq, Some(Duration::from_millis(50))),
        Err(Error::Timeout { sequence }) if sequence == seq
    ));

    read_n(&daemon, 1);
    reply(&daemon, seq, json!(42));
    reply(&daemon, seq, json!(42));
    assert_eq!(correlator.await_response(seq, Some(Duration::from_secs(2))).unwrap(), json!(42));
}

#[test]
fn oversize_request_is_rejected_before_queueing() {
    let (client, daemon) = channel_pair(32);
    let (dispatcher, _correlator) = start(client);

    match dispatcher.submit(Command::Call, vec![b'x'; 33]) {
        Err(Error::FrameTooLarge { size: 33, capacity: 32 }) => {}
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(dispatcher.submit(Command::Call, vec![b'x'; 32]).unwrap(), 1);
    assert_eq!(read_n(&daemon, 1)[0].payload.len(), 32);
}

#[test]
fn shutdown_closes_waiters_and_is_idempotent() {
    let (client, _daemon) = channel_pair(256);
    let (dispatcher, correlator) = start(client);
    assert!(dispatcher.workers_alive());

    let seq = dispatcher.submit(Command::Call, b"{}".to_vec()).unwrap();
    dispatcher.shutdown();
    dispatcher.shutdown();
    assert!(!dispatcher.workers_alive());

    let start = Instant::now();
    assert!(matches!(correlator.await_response(seq, None), Err(Error::ChannelClosed)));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(matches!(dispatcher.submit(Command::Call, b"{}".to_vec()), Err(Error::ChannelClosed)));
}

#[test]
fn connection_call_and_close() {
    let (client, daemon) = channel_pair(256);
    let conn = Arc::new(Connection::attach(client, Config::default()).expect("attach"));

    let c = Arc::clone(&conn);
    let caller = thread::spawn(move || c.call(Command::Alive, Vec::new(), Some(Duration::from_secs(5))));
    let frames = read_n(&daemon, 1);
    assert_eq!(frames[0].command, Command::Alive);
    reply(&daemon, frames[0].sequence, json!(null));
    assert_eq!(caller.join().unwrap().unwrap(), json!(null));

    // One-way returns without any reply.
    assert_eq!(conn.call(Command::OneWay, b"{}".to_vec(), None).unwrap(), json!(null));

    let id = conn.client_id().to_string();
    conn.close();
    conn.close();
    assert!(conn.is_closed());
    assert!(matches!(conn.request(Command::Alive, Vec::new()), Err(Error::NotConnected)));
    assert!(region::open_request_region(&id).is_err());
    assert!(region::open_response_region(&id).is_err());
}

#[test]
fn oversize_for_the_length_field_stays_local() {
    // A region bigger than the u16 length field can describe.
    let (client, _daemon) = channel_pair(70_000);
    let (dispatcher, _correlator) = start(client);
    assert_eq!(dispatcher.max_payload(), 65_535);

    match dispatcher.submit(Command::Call, vec![b'x'; 66_000]) {
        Err(Error::FrameTooLarge { size: 66_000, capacity: 65_535 }) => {}
        other => panic!("unexpected: {other:?}"),
    }
    thread::sleep(Duration::from_millis(100));
    assert!(!dispatcher.is_closed());
    assert_eq!(dispatcher.submit(Command::Call, b"{}".to_vec()).unwrap(), 1);
}

#[test]
fn shutdown_releases_submitters_blocked_on_a_full_queue() {
    let (client, _daemon) = channel_pair(256);
    let config = Config {
        queue_depth: 1,
        ..Config::default()
    };
    let (dispatcher, _inbound) = Dispatcher::start(Arc::new(client), &config).expect("start");
    let dispatcher = Arc::new(dispatcher);

    // Nobody reads the request region: one frame lands in it, one sits in
    // the send worker, one fills the queue and the rest block.
    let submitters: Vec<_> = (0..6)
        .map(|_| {
            let d = Arc::clone(&dispatcher);
            thread::spawn(move || d.submit(Command::OneWay, b"{}".to_vec()))
        })
        .collect();
    thread::sleep(Duration::from_millis(200));

    let d = Arc::clone(&dispatcher);
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        d.shutdown();
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok(), "shutdown hung");

    let results: Vec<_> = submitters.into_iter().map(|h| h.join().unwrap()).collect();
    let closed = results.iter().filter(|r| matches!(r, Err(Error::ChannelClosed))).count();
    assert!(closed >= 1, "{results:?}");
    assert!(results.iter().all(|r| r.is_ok() || matches!(r, Err(Error::ChannelClosed))));
}

#[test]
fn one_way_gives_up_when_the_queue_stays_full() {
    let (client, _daemon) = channel_pair(256);
    let config = Config {
        queue_depth: 1,
        ..Config::default()
    }
    .with_call_timeout(Some(Duration::from_millis(200)));
    let conn = Connection::attach(client, config).expect("attach");

    let start = Instant::now();
    let mut outcome = Ok(0);
    for _ in 0..10 {
        outcome = conn.request(Command::OneWay, b"{}".to_vec());
        if outcome.is_err() {
            break;
        }
    }
    assert!(matches!(outcome, Err(Error::Timeout { .. })), "{outcome:?}");
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(!conn.is_closed());
}

#[test]
fn close_is_prompt_with_calls_in_flight_and_a_silent_daemon() {
    let (client, _daemon) = channel_pair(256);
    let config = Config {
        queue_depth: 1,
        ..Config::default()
    };
    let conn = Arc::new(Connection::attach(client, config).expect("attach"));

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let c = Arc::clone(&conn);
            thread::spawn(move || c.call(Command::Call, b"{}".to_vec(), None))
        })
        .collect();
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    conn.close();
    assert!(start.elapsed() < Duration::from_secs(3));

    for h in callers {
        match h.join().unwrap() {
            Err(Error::ChannelClosed) | Err(Error::NotConnected) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}

#[test]
fn alive_is_false_when_the_daemon_stops_reading() {
    let (client, _daemon) = channel_pair(256);
    let alive_timeout = Duration::from_millis(200);
    let conn = Connection::attach(client, Config::default().with_alive_timeout(alive_timeout)).expect("attach");

    let start = Instant::now();
    assert!(!conn.is_alive());
    assert!(start.elapsed() >= alive_timeout);
    assert!(start.elapsed() < alive_timeout + Duration::from_secs(1));

    // Later checks queue up behind the unread frame and still return.
    for _ in 0..3 {
        let start = Instant::now();
        assert!(!conn.is_alive());
        assert!(start.elapsed() < alive_timeout + Duration::from_secs(1));
    }
}
