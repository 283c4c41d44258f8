//! Steady clock with support for artificial time shifts.
//!
//! Cache expiry and the retransmission window measure elapsed time against
//! this clock instead of [`Instant::now`] directly, so tests can fast-forward
//! without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static SHIFT_MILLIS: AtomicU64 = AtomicU64::new(0);

/// Current steady time, including any shift applied via [`add_time_shift`].
pub fn now() -> Instant {
    Instant::now() + Duration::from_millis(SHIFT_MILLIS.load(Ordering::Relaxed))
}

/// Advance the clock by `shift`. The shift is cumulative and process-wide.
pub fn add_time_shift(shift: Duration) {
    SHIFT_MILLIS.fetch_add(shift.as_millis() as u64, Ordering::Relaxed);
}

/// Serializes tests that shift or observe the process-wide clock.
#[cfg(test)]
pub(crate) static TEST_MUTEX: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
