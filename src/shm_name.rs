// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Naming of the per-connection OS resources.
//
// Every connection owns two shm regions and two semaphores, all derived from
// the client id: `<id>_req` and `<id>_res`. POSIX shm and semaphore names
// live in separate namespaces, so a region and its semaphore share a name.

/// Suffix of the client-owned request region and semaphore.
pub const REQUEST_SUFFIX: &str = "_req";
/// Suffix of the daemon-owned response region and semaphore.
pub const RESPONSE_SUFFIX: &str = "_res";

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maximum length for POSIX shm/semaphore names. 0 disables truncation.
///
/// On macOS both `PSHMNAMLEN` and `PSEMNAMLEN` are 31, which a 32-character
/// client id plus suffix already exceeds.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Name of the request region/semaphore for a client id.
pub fn request_name(client_id: &str) -> String {
    format!("{client_id}{REQUEST_SUFFIX}")
}

/// Name of the response region/semaphore for a client id.
pub fn response_name(client_id: &str) -> String {
    format!("{client_id}{RESPONSE_SUFFIX}")
}

/// Produce a POSIX-safe name (with leading '/').
///
/// When `SHM_NAME_MAX > 0`, names that would exceed it are shortened to
/// `/<prefix>_<16-hex-FNV-1a-hash>`, keeping a prefix for debuggability.
/// Both peers apply the same rule, so they agree on the shortened name.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 || result.len() <= SHM_NAME_MAX {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = SHM_NAME_MAX.saturating_sub(HASH_SUFFIX_LEN + 1);

    let hash = hex::encode(fnv1a_64(result.as_bytes()).to_be_bytes());

    let mut shortened = String::with_capacity(SHM_NAME_MAX);
    shortened.push('/');
    let body = &result[1..];
    shortened.push_str(&body[..prefix_len.min(body.len())]);
    shortened.push('_');
    shortened.push_str(&hash);
    shortened
}
