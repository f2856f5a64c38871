// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory handle.
// Delegates to platform::PlatformShm.

use std::io;

use crate::platform::PlatformShm;

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively; fail if already exists. The handle owns the name.
    Create,
    /// Open existing; fail if it does not exist.
    Open,
}

/// A named, inter-process shared memory region.
///
/// The creating handle owns the name and unlinks it when dropped; handles
/// obtained with [`ShmOpenMode::Open`] only unmap.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Acquire a named shared memory region of `size` bytes.
    ///
    /// With [`ShmOpenMode::Open`], `size` is the minimum acceptable size and
    /// the mapping covers the whole existing object.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let platform_mode = match mode {
            ShmOpenMode::Create => crate::platform::posix::ShmMode::Create,
            ShmOpenMode::Open => crate::platform::posix::ShmMode::Open,
        };
        let inner = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(Self { inner })
    }

    /// Pointer to the start of the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Mutable pointer to the start of the region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// The platform name used to open the segment.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Whether this handle created (and therefore owns) the segment.
    pub fn is_owner(&self) -> bool {
        self.inner.is_owner()
    }

    /// Remove the backing object. Succeeds if it is already gone.
    pub fn unlink(&self) -> io::Result<()> {
        self.inner.unlink()
    }

    /// Remove a named shm segment without needing an open handle.
    /// Succeeds if it is already gone.
    pub fn unlink_by_name(name: &str) -> io::Result<()> {
        PlatformShm::unlink_by_name(name)
    }

    /// Whether a segment of this name currently exists.
    pub fn exists(name: &str) -> io::Result<bool> {
        PlatformShm::exists(name)
    }
}
