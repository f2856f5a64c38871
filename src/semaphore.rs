// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process counting semaphore.
// Delegates to platform::PlatformSemaphore.

use std::io;
use std::time::Duration;

use crate::platform::PlatformSemaphore;

/// A named, inter-process counting semaphore.
///
/// On POSIX this is a `sem_open` semaphore. The creating handle owns the
/// name and unlinks it when dropped.
pub struct IpcSemaphore {
    inner: PlatformSemaphore,
}

impl IpcSemaphore {
    /// Create a semaphore exclusively with an initial `count`.
    /// Fails with `AlreadyExists` if the name is taken.
    pub fn create(name: &str, count: u32) -> io::Result<Self> {
        let inner = PlatformSemaphore::create(name, count)?;
        Ok(Self { inner })
    }

    /// Open an existing semaphore created by another handle or process.
    pub fn open(name: &str) -> io::Result<Self> {
        let inner = PlatformSemaphore::open(name)?;
        Ok(Self { inner })
    }

    /// The platform name of the semaphore.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Wait (decrement). `None` blocks forever.
    /// Returns `Ok(false)` if `timeout_ms` elapsed first.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        self.inner.wait(timeout_ms.map(Duration::from_millis))
    }

    /// Wait with a `Duration` timeout.
    pub fn wait_for(&self, timeout: Duration) -> io::Result<bool> {
        self.inner.wait(Some(timeout))
    }

    /// Decrement if possible without blocking.
    pub fn try_wait(&self) -> io::Result<bool> {
        self.inner.try_wait()
    }

    /// Post (increment) `count` times.
    pub fn post(&self, count: u32) -> io::Result<()> {
        self.inner.post(count)
    }

    /// Remove the name. Succeeds if it is already gone.
    pub fn unlink(&self) -> io::Result<()> {
        self.inner.unlink()
    }

    /// Remove a named semaphore without an open handle.
    /// Succeeds if it is already gone.
    pub fn clear_storage(name: &str) -> io::Result<()> {
        PlatformSemaphore::unlink_by_name(name)
    }
}
