// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of named shared memory regions and named semaphores.
// Regions are created exclusively by their owner and opened by the peer;
// only the owner unlinks on drop.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::time::{Duration, Instant};

use crate::shm_name;

/// Permissions for both shm objects and semaphores: owner read/write only.
const PERMS: libc::mode_t = 0o600;

fn c_name(posix_name: &str) -> io::Result<CString> {
    CString::new(posix_name.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Treat "already removed" as success so teardown can run more than once.
fn ignore_missing(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let e = io::Error::last_os_error();
    if e.raw_os_error() == Some(libc::ENOENT) {
        Ok(())
    } else {
        Err(e)
    }
}

// ---------------------------------------------------------------------------
// PlatformShm: POSIX shared memory
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    name: String, // POSIX name (with leading '/')
    owner: bool,  // created by this handle; unlinks on drop
}

// Safety: the shared memory region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

/// Open mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
}

impl PlatformShm {
    /// Acquire a named shared memory region.
    ///
    /// `Create` fails with `AlreadyExists` if the name is taken. `Open` maps
    /// the existing object at its current size and fails if that is smaller
    /// than `size`.
    pub fn acquire(name: &str, size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if size == 0 && mode == ShmMode::Create {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let cn = c_name(&posix_name)?;

        match mode {
            ShmMode::Create => {
                let fd = unsafe {
                    libc::shm_open(
                        cn.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        PERMS as libc::c_uint,
                    )
                };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                unsafe { libc::fchmod(fd, PERMS) };
                let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
                if ret != 0 {
                    let err = io::Error::last_os_error();
                    unsafe {
                        libc::close(fd);
                        libc::shm_unlink(cn.as_ptr());
                    }
                    return Err(err);
                }
                Self::mmap_and_finish(fd, size, posix_name, true).inspect_err(|_| unsafe {
                    libc::shm_unlink(cn.as_ptr());
                })
            }
            ShmMode::Open => {
                let fd = unsafe { libc::shm_open(cn.as_ptr(), libc::O_RDWR, PERMS as libc::c_uint) };
                if fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                if unsafe { libc::fstat(fd, &mut st) } != 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
                let actual = st.st_size as usize;
                if actual == 0 || actual < size {
                    unsafe { libc::close(fd) };
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("shm {posix_name} is {actual} bytes, expected at least {size}"),
                    ));
                }
                Self::mmap_and_finish(fd, actual, posix_name, false)
            }
        }
    }

    fn mmap_and_finish(fd: i32, size: usize, posix_name: String, owner: bool) -> io::Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            name: posix_name,
            owner,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// POSIX name (with leading '/').
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Remove the backing object (shm_unlink). Does NOT release the mapping.
    pub fn unlink(&self) -> io::Result<()> {
        let cn = c_name(&self.name)?;
        ignore_missing(unsafe { libc::shm_unlink(cn.as_ptr()) })
    }

    /// Unlink a named shm segment by name (static helper).
    pub fn unlink_by_name(name: &str) -> io::Result<()> {
        let cn = c_name(&shm_name::make_shm_name(name))?;
        ignore_missing(unsafe { libc::shm_unlink(cn.as_ptr()) })
    }

    /// Whether a shm object of this name currently exists.
    pub fn exists(name: &str) -> io::Result<bool> {
        let cn = c_name(&shm_name::make_shm_name(name))?;
        let fd = unsafe { libc::shm_open(cn.as_ptr(), libc::O_RDONLY, 0) };
        if fd != -1 {
            unsafe { libc::close(fd) };
            return Ok(true);
        }
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(e)
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        if self.owner {
            let _ = self.unlink();
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformSemaphore: POSIX named semaphore (sem_open)
// ---------------------------------------------------------------------------

pub struct PlatformSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    owner: bool,
}

// Safety: sem_t handles returned by sem_open are usable from any thread.
unsafe impl Send for PlatformSemaphore {}
unsafe impl Sync for PlatformSemaphore {}

impl PlatformSemaphore {
    /// Create a named semaphore exclusively with the given initial count.
    pub fn create(name: &str, count: u32) -> io::Result<Self> {
        let posix_name = shm_name::make_shm_name(name);
        let cn = c_name(&posix_name)?;
        let sem = unsafe {
            libc::sem_open(
                cn.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                PERMS as libc::c_uint,
                count as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            sem,
            name: posix_name,
            owner: true,
        })
    }

    /// Open an existing named semaphore.
    pub fn open(name: &str) -> io::Result<Self> {
        let posix_name = shm_name::make_shm_name(name);
        let cn = c_name(&posix_name)?;
        let sem = unsafe { libc::sem_open(cn.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            sem,
            name: posix_name,
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decrement the semaphore. `None` blocks indefinitely.
    /// Returns `Ok(false)` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        match timeout {
            None => loop {
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return Ok(true);
                }
                let e = io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::EINTR) {
                    return Err(e);
                }
            },
            Some(t) => self.timed_wait(t),
        }
    }

    #[cfg(target_os = "macos")]
    fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        // macOS lacks sem_timedwait; emulate via try_wait polling.
        let deadline = Instant::now() + timeout;
        let mut k = 0u32;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            crate::backoff::adaptive_yield(&mut k);
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        let ns_total = ts.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        ts.tv_sec += timeout.as_secs() as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
        ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;
        let started = Instant::now();
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &ts) } == 0 {
                return Ok(true);
            }
            let e = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) if started.elapsed() < timeout => continue,
                Some(libc::EINTR) => return Ok(false),
                _ => return Err(e),
            }
        }
    }

    /// Try to decrement without blocking.
    pub fn try_wait(&self) -> io::Result<bool> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        let e = io::Error::last_os_error();
        match e.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(e),
        }
    }

    /// Increment the semaphore `count` times.
    pub fn post(&self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            if unsafe { libc::sem_post(self.sem) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Remove the name (sem_unlink). Open handles stay usable.
    pub fn unlink(&self) -> io::Result<()> {
        let cn = c_name(&self.name)?;
        ignore_missing(unsafe { libc::sem_unlink(cn.as_ptr()) })
    }

    pub fn unlink_by_name(name: &str) -> io::Result<()> {
        let cn = c_name(&shm_name::make_shm_name(name))?;
        ignore_missing(unsafe { libc::sem_unlink(cn.as_ptr()) })
    }
}

impl Drop for PlatformSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
        if self.owner {
            let _ = self.unlink();
        }
    }
}

/// Unlink both a shm object and a semaphore by name without open handles.
/// Only touches async-signal-safe libc calls once `names` is prepared.
pub(crate) fn unlink_raw(names: &[CString]) {
    for n in names {
        unsafe {
            libc::shm_unlink(n.as_ptr());
            libc::sem_unlink(n.as_ptr());
        }
    }
}

/// Pre-compute the C names `unlink_raw` needs for a resource name.
pub(crate) fn raw_name(name: &str) -> io::Result<CString> {
    c_name(&shm_name::make_shm_name(name))
}
