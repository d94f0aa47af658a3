// File:    throughput.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Fixed-window throughput meter.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Length of the measuring window.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

/// Bytes per second over the last completed 10-second window.
#[derive(Debug)]
pub struct ThroughputMeter {
    window_start: Mutex<Instant>,
    window_bytes: AtomicU64,
    total_bytes: AtomicU64,
    current: AtomicU32,
}

impl ThroughputMeter {
    /// Meter whose first window starts now.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Meter whose first window starts at `start`.
    #[must_use]
    pub const fn starting_at(start: Instant) -> Self {
        Self {
            window_start: Mutex::new(start),
            window_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            current: AtomicU32::new(0),
        }
    }

    /// Accounts `bytes` processed now.
    pub fn record(&self, bytes: usize) {
        self.record_at(bytes, Instant::now());
    }

    /// Accounts `bytes` processed at `now`.
    ///
    /// A record at least one window after the window start closes the
    /// window: its bytes count towards it and the rate is published.
    pub fn record_at(&self, bytes: usize, now: Instant) {
        let bytes = bytes as u64;
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        let mut start = self
            .window_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let in_window = self.window_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if now.duration_since(*start) >= THROUGHPUT_WINDOW {
            let rate = in_window / THROUGHPUT_WINDOW.as_secs();
            self.current
                .store(u32::try_from(rate).unwrap_or(u32::MAX), Ordering::Relaxed);
            self.window_bytes.store(0, Ordering::Relaxed);
            *start = now;
        }
    }

    /// Bytes per second of the last completed window.
    #[must_use]
    pub fn throughput(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    /// Bytes recorded since creation.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}
