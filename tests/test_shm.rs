// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory: exclusive creation, opening, ownership and unlink.

use std::sync::atomic::{AtomicUsize, Ordering};

use capipc::{ShmHandle, ShmOpenMode};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{n}", std::process::id())
}

#[test]
fn create_maps_requested_size() {
    let name = unique_name("shm_create");
    let shm = ShmHandle::acquire(&name, 1024, ShmOpenMode::Create).expect("create");
    assert_eq!(shm.size(), 1024);
    assert!(shm.is_owner());
    assert!(!shm.as_ptr().is_null());
}

#[test]
fn open_nonexistent_fails() {
    let name = unique_name("shm_open_missing");
    let err = ShmHandle::acquire(&name, 64, ShmOpenMode::Open).err().expect("must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn create_is_exclusive() {
    let name = unique_name("shm_exclusive");
    let _first = ShmHandle::acquire(&name, 64, ShmOpenMode::Create).expect("create");
    let err = ShmHandle::acquire(&name, 64, ShmOpenMode::Create).err().expect("second create");
    assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
}

#[test]
fn opener_sees_creator_writes() {
    let name = unique_name("shm_shared");
    let owner = ShmHandle::acquire(&name, 256, ShmOpenMode::Create).expect("create");
    let peer = ShmHandle::acquire(&name, 0, ShmOpenMode::Open).expect("open");
    assert!(!peer.is_owner());
    assert_eq!(peer.size(), 256);

    let data = b"turn-taking";
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), owner.as_mut_ptr(), data.len());
        assert_eq!(std::slice::from_raw_parts(peer.as_ptr(), data.len()), data);
    }
}

#[test]
fn open_rejects_segment_smaller_than_required() {
    let name = unique_name("shm_small");
    let _owner = ShmHandle::acquire(&name, 32, ShmOpenMode::Create).expect("create");
    let err = ShmHandle::acquire(&name, 64, ShmOpenMode::Open).err().expect("too small");
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn owner_unlinks_on_drop_opener_does_not() {
    let name = unique_name("shm_owner_drop");
    let owner = ShmHandle::acquire(&name, 64, ShmOpenMode::Create).expect("create");
    let peer = ShmHandle::acquire(&name, 0, ShmOpenMode::Open).expect("open");
    drop(peer);
    assert!(ShmHandle::exists(&name).unwrap());
    drop(owner);
    assert!(!ShmHandle::exists(&name).unwrap());
}

#[test]
fn unlink_is_idempotent() {
    let name = unique_name("shm_unlink_twice");
    let shm = ShmHandle::acquire(&name, 64, ShmOpenMode::Create).expect("create");
    shm.unlink().expect("first unlink");
    shm.unlink().expect("second unlink");
    ShmHandle::unlink_by_name(&name).expect("by name after unlink");
    assert!(ShmHandle::acquire(&name, 0, ShmOpenMode::Open).is_err());
}

#[test]
fn mapping_survives_unlink() {
    let name = unique_name("shm_after_unlink");
    let shm = ShmHandle::acquire(&name, 64, ShmOpenMode::Create).expect("create");
    ShmHandle::unlink_by_name(&name).expect("unlink");
    unsafe {
        *shm.as_mut_ptr() = 0x5a;
        assert_eq!(*shm.as_ptr(), 0x5a);
    }
}

#[test]
fn empty_name_and_zero_size_fail() {
    assert!(ShmHandle::acquire("", 64, ShmOpenMode::Create).is_err());
    assert!(ShmHandle::acquire(&unique_name("shm_zero"), 0, ShmOpenMode::Create).is_err());
}

#[test]
fn various_sizes() {
    for size in [1usize, 4096, 10 * 1024 + 9, 1024 * 1024 + 9] {
        let name = unique_name("shm_sizes");
        let shm = ShmHandle::acquire(&name, size, ShmOpenMode::Create).expect("create");
        assert_eq!(shm.size(), size);
        unsafe { *shm.as_mut_ptr().add(size - 1) = 1 };
    }
}
