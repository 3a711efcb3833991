//! Tick counter and time conversion
//!
//! The tick counter is a word-sized monotonic value and is read without a
//! lock; only the tick trap entry advances it.
use core::sync::atomic::{AtomicU32, Ordering};

use crate::hal;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Ticks since boot. Wraps around at `u32::MAX`.
#[inline]
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot, from the port's microsecond clock.
pub fn uptime_ms() -> u64 {
    hal::port().read_us() / 1000
}

/// Advance the tick counter by one and return the new value. Called from
/// the tick trap entry only.
pub(crate) fn advance_tick() -> u32 {
    TICKS.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Reset the counter at boot.
pub(crate) fn reset() {
    TICKS.store(0, Ordering::Relaxed);
}

/// Convert a duration in milliseconds to ticks at the given tick rate,
/// rounding up, with a minimum of one tick.
pub(crate) fn ms_to_ticks_at(ms: u32, tick_hz: u32) -> u32 {
    let ticks = num_integer::Integer::div_ceil(&(ms as u64 * tick_hz as u64), &1000);
    ticks.clamp(1, u32::MAX as u64) as u32
}

/// Convert a duration in milliseconds to ticks of the installed port's
/// timer.
pub fn ms_to_ticks(ms: u32) -> u32 {
    ms_to_ticks_at(ms, hal::port().tick_hz())
}
