// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared channel: a request region and a response region, each a named shm
// segment paired with a named binary semaphore.
//
// Region layout:
//
//   [0]      status byte; bit 7 is the turn flag ("unread frame present")
//   [1..]    frame header + payload
//
// The semaphore gives mutual exclusion; the turn flag tells the holder whether
// it is its turn. A writer that finds the flag set (or a reader that finds it
// clear) releases the semaphore and retries with backoff.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::backoff::Backoff;
use crate::codec::{RequestFrame, ResponseFrame, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN};
use crate::error::Result;
use crate::semaphore::IpcSemaphore;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::shm_name;

/// Bit of the status byte marking an unread frame.
pub const TURN_FLAG: u8 = 0x80;
const STATUS_LEN: usize = 1;

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// One direction of a shared channel.
pub struct Region {
    shm: ShmHandle,
    sem: IpcSemaphore,
    name: String,
    header_len: usize,
}

impl Region {
    /// Total shm size needed for `capacity` payload bytes behind `header_len`.
    pub const fn size_for(header_len: usize, capacity: usize) -> usize {
        STATUS_LEN + header_len + capacity
    }

    /// Create the region and its semaphore exclusively. Fails if either
    /// name already exists; nothing is left behind on failure.
    pub fn create(name: &str, header_len: usize, capacity: usize) -> io::Result<Self> {
        let shm = ShmHandle::acquire(name, Self::size_for(header_len, capacity), ShmOpenMode::Create)?;
        let sem = IpcSemaphore::create(name, 1)?;
        let region = Self {
            shm,
            sem,
            name: name.to_string(),
            header_len,
        };
        region.status().store(0, Ordering::Release);
        Ok(region)
    }

    /// Open a region created by the peer.
    pub fn open(name: &str, header_len: usize) -> io::Result<Self> {
        let shm = ShmHandle::acquire(name, Self::size_for(header_len, 0), ShmOpenMode::Open)?;
        let sem = IpcSemaphore::open(name)?;
        Ok(Self {
            shm,
            sem,
            name: name.to_string(),
            header_len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    /// Largest payload a single frame may carry.
    pub fn capacity(&self) -> usize {
        self.shm.size() - STATUS_LEN - self.header_len
    }

    fn status(&self) -> &AtomicU8 {
        unsafe { &*(self.shm.as_ptr() as *const AtomicU8) }
    }

    /// Whether an unread frame is present. Advisory outside a guard.
    pub fn has_unread(&self) -> bool {
        self.status().load(Ordering::Acquire) & TURN_FLAG != 0
    }

    /// Wait until the region is free to receive a frame.
    ///
    /// Returns `Ok(None)` if `timeout` elapses first; `None` waits forever.
    pub fn acquire_for_write(&self, timeout: Option<Duration>) -> io::Result<Option<WriteGuard<'_>>> {
        Ok(self.acquire(false, timeout)?.then(|| WriteGuard { region: self }))
    }

    /// Wait until the region holds an unread frame.
    ///
    /// Returns `Ok(None)` if `timeout` elapses first; `None` waits forever.
    pub fn acquire_for_read(&self, timeout: Option<Duration>) -> io::Result<Option<ReadGuard<'_>>> {
        Ok(self.acquire(true, timeout)?.then(|| ReadGuard { region: self }))
    }

    /// Take the semaphore at a moment when the turn flag equals `want_unread`.
    fn acquire(&self, want_unread: bool, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff = Backoff::new();
        loop {
            let got = match deadline {
                None => self.sem.wait(None)?,
                Some(dl) => self.sem.wait_for(dl.saturating_duration_since(Instant::now()))?,
            };
            if !got {
                return Ok(false);
            }
            if self.has_unread() == want_unread {
                return Ok(true);
            }
            self.sem.post(1)?;
            if deadline.is_some_and(|dl| Instant::now() >= dl) {
                return Ok(false);
            }
            backoff.snooze();
        }
    }

    fn frame_area(&self) -> *mut u8 {
        unsafe { self.shm.as_mut_ptr().add(STATUS_LEN) }
    }

    fn frame_area_len(&self) -> usize {
        self.shm.size() - STATUS_LEN
    }

    /// Remove the shm object and semaphore names. Safe to repeat.
    pub fn unlink(&self) -> io::Result<()> {
        self.shm.unlink()?;
        self.sem.unlink()
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Exclusive write access to a free region. Releases the semaphore on drop.
pub struct WriteGuard<'a> {
    region: &'a Region,
}

impl WriteGuard<'_> {
    /// The frame area (header + payload), writable in place.
    pub fn buffer(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.region.frame_area(), self.region.frame_area_len())
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Mark the written frame as unread.
    pub fn commit(self) {
        self.region.status().fetch_or(TURN_FLAG, Ordering::Release);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.region.sem.post(1) {
            warn!(region = %self.region.name, error = %e, "failed to release region semaphore");
        }
    }
}

/// Exclusive read access to an unread frame. Releases the semaphore on drop.
pub struct ReadGuard<'a> {
    region: &'a Region,
}

impl ReadGuard<'_> {
    /// The frame area (header + payload).
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region.frame_area(), self.region.frame_area_len()) }
    }

    /// Mark the frame as read, handing the turn back to the writer.
    pub fn consume(self) {
        self.region.status().fetch_and(!TURN_FLAG, Ordering::Release);
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.region.sem.post(1) {
            warn!(region = %self.region.name, error = %e, "failed to release region semaphore");
        }
    }
}

// ---------------------------------------------------------------------------
// SharedChannel
// ---------------------------------------------------------------------------

/// Which end of the channel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Daemon,
}

/// The request/response region pair of one connection.
///
/// The client writes the request region and reads the response region; the
/// daemon does the opposite. Each region has exactly one writer and one
/// reader.
pub struct SharedChannel {
    client_id: String,
    side: Side,
    request: Region,
    response: Region,
}

impl SharedChannel {
    pub fn new(client_id: &str, side: Side, request: Region, response: Region) -> Self {
        Self {
            client_id: client_id.to_string(),
            side,
            request,
            response,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn request_capacity(&self) -> usize {
        self.request.capacity()
    }

    pub fn response_capacity(&self) -> usize {
        self.response.capacity()
    }

    pub fn request_region(&self) -> &Region {
        &self.request
    }

    pub fn response_region(&self) -> &Region {
        &self.response
    }

    /// Client: write one request frame. `Ok(false)` on timeout.
    pub fn send_request(&self, frame: &RequestFrame, timeout: Option<Duration>) -> Result<bool> {
        debug_assert_eq!(self.side, Side::Client);
        let Some(mut guard) = self.request.acquire_for_write(timeout)? else {
            return Ok(false);
        };
        let capacity = guard.capacity();
        frame.encode_into(guard.buffer(), capacity)?;
        guard.commit();
        Ok(true)
    }

    /// Client: read one response frame. `Ok(None)` on timeout.
    pub fn recv_response(&self, timeout: Option<Duration>) -> Result<Option<ResponseFrame>> {
        debug_assert_eq!(self.side, Side::Client);
        let Some(guard) = self.response.acquire_for_read(timeout)? else {
            return Ok(None);
        };
        let frame = ResponseFrame::decode(guard.bytes());
        guard.consume();
        frame.map(Some)
    }

    /// Daemon: read one request frame. `Ok(None)` on timeout.
    pub fn recv_request(&self, timeout: Option<Duration>) -> Result<Option<RequestFrame>> {
        debug_assert_eq!(self.side, Side::Daemon);
        let Some(guard) = self.request.acquire_for_read(timeout)? else {
            return Ok(None);
        };
        let frame = RequestFrame::decode(guard.bytes());
        guard.consume();
        frame.map(Some)
    }

    /// Daemon: write one response frame. `Ok(false)` on timeout.
    pub fn send_response(&self, frame: &ResponseFrame, timeout: Option<Duration>) -> Result<bool> {
        debug_assert_eq!(self.side, Side::Daemon);
        let Some(mut guard) = self.response.acquire_for_write(timeout)? else {
            return Ok(false);
        };
        let capacity = guard.capacity();
        frame.encode_into(guard.buffer(), capacity)?;
        guard.commit();
        Ok(true)
    }

    /// Unlink all four names (both regions, both semaphores).
    ///
    /// Already-removed names are ignored, so this is safe to call from both
    /// peers and more than once. Other failures are logged, not returned.
    pub fn unlink(&self) {
        for region in [&self.request, &self.response] {
            if let Err(e) = region.unlink() {
                warn!(region = %region.name(), error = %e, "unlink failed");
            }
        }
    }
}

/// Unlink the resources of a connection by client id, without open handles.
pub fn unlink_by_id(client_id: &str) {
    for name in [shm_name::request_name(client_id), shm_name::response_name(client_id)] {
        if let Err(e) = ShmHandle::unlink_by_name(&name) {
            warn!(%name, error = %e, "shm unlink failed");
        }
        if let Err(e) = IpcSemaphore::clear_storage(&name) {
            warn!(%name, error = %e, "semaphore unlink failed");
        }
    }
}

/// Create the client-owned request region for `client_id`.
pub fn create_request_region(client_id: &str, capacity: usize) -> io::Result<Region> {
    Region::create(&shm_name::request_name(client_id), REQUEST_HEADER_LEN, capacity)
}

/// Create the daemon-owned response region for `client_id`.
pub fn create_response_region(client_id: &str, capacity: usize) -> io::Result<Region> {
    Region::create(&shm_name::response_name(client_id), RESPONSE_HEADER_LEN, capacity)
}

pub fn open_request_region(client_id: &str) -> io::Result<Region> {
    Region::open(&shm_name::request_name(client_id), REQUEST_HEADER_LEN)
}

pub fn open_response_region(client_id: &str) -> io::Result<Region> {
    Region::open(&shm_name::response_name(client_id), RESPONSE_HEADER_LEN)
}
