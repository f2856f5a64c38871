// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Signal-driven cleanup of named OS resources.
//
// Live connections are tracked by client id with their POSIX names already
// converted to C strings. Every change republishes a flat snapshot of all
// names behind an atomic pointer; the handler takes that snapshot with one
// swap and only calls `shm_unlink`, `sem_unlink`, `signal` and `raise`.
// On SIGINT, SIGTERM or SIGHUP every tracked name is unlinked and the signal
// is re-raised with the default disposition.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::platform::posix::{raw_name, unlink_raw};
use crate::shm_name;

struct Tracked {
    client_id: String,
    names: Vec<CString>,
}

static TRACKED: Mutex<Vec<Tracked>> = Mutex::new(Vec::new());
/// Owned `Box<Vec<CString>>` of every tracked name, or null when empty.
static SNAPSHOT: AtomicPtr<Vec<CString>> = AtomicPtr::new(ptr::null_mut());
static INSTALLED: AtomicBool = AtomicBool::new(false);

const SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

/// Remember the resources of `client_id` so a termination signal unlinks them.
pub fn track(client_id: &str) -> io::Result<()> {
    let names = [shm_name::request_name(client_id), shm_name::response_name(client_id)]
        .iter()
        .map(|n| raw_name(n))
        .collect::<io::Result<Vec<_>>>()?;
    let mut list = TRACKED.lock().unwrap_or_else(PoisonError::into_inner);
    if !list.iter().any(|t| t.client_id == client_id) {
        list.push(Tracked {
            client_id: client_id.to_string(),
            names,
        });
        publish(&list);
    }
    Ok(())
}

/// Stop tracking `client_id`; its resources were torn down normally.
pub fn untrack(client_id: &str) {
    let mut list = TRACKED.lock().unwrap_or_else(PoisonError::into_inner);
    let before = list.len();
    list.retain(|t| t.client_id != client_id);
    if list.len() != before {
        publish(&list);
    }
}

/// Replace the handler's snapshot. Called with `TRACKED` held.
fn publish(list: &[Tracked]) {
    let names: Vec<CString> = list.iter().flat_map(|t| t.names.iter().cloned()).collect();
    let fresh = if names.is_empty() {
        ptr::null_mut()
    } else {
        Box::into_raw(Box::new(names))
    };
    let old = SNAPSHOT.swap(fresh, Ordering::AcqRel);
    if !old.is_null() {
        // SAFETY: `old` came from `Box::into_raw` and the swap made this
        // the only owner; the handler never stores a pointer back.
        drop(unsafe { Box::from_raw(old) });
    }
}

pub fn is_tracked(client_id: &str) -> bool {
    TRACKED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .any(|t| t.client_id == client_id)
}

/// Unlink every tracked name. Lock-free and allocation-free; returns
/// `false` if nothing was tracked.
///
/// The snapshot is taken, not borrowed, and is leaked: the process is about
/// to die, and freeing is not async-signal-safe.
fn unlink_tracked() -> bool {
    let names = SNAPSHOT.swap(ptr::null_mut(), Ordering::AcqRel);
    if names.is_null() {
        return false;
    }
    // SAFETY: the swap transferred ownership of the published box.
    unlink_raw(unsafe { &*names });
    true
}

/// Install the SIGINT/SIGTERM/SIGHUP handlers. Only the first call acts.
pub fn install() {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    for sig in SIGNALS {
        let prev = unsafe { libc::signal(sig, on_signal as *const () as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            warn!(signal = sig, error = %io::Error::last_os_error(), "failed to install cleanup handler");
        }
    }
    debug!("cleanup signal handlers installed");
}

extern "C" fn on_signal(sig: libc::c_int) {
    let _ = unlink_tracked();
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}
