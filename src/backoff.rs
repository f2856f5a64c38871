// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adaptive backoff for retry loops: spin → pause → yield → sleep.

use std::time::Duration;

/// Adaptive backoff step.
///
/// - k < 4:  busy spin (do nothing)
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// Stateful wrapper around [`adaptive_yield`] for a single retry loop.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    k: u32,
}

impl Backoff {
    pub(crate) const fn new() -> Self {
        Self { k: 0 }
    }

    #[inline]
    pub(crate) fn snooze(&mut self) {
        adaptive_yield(&mut self.k);
    }
}
