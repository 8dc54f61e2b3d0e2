//! Monotonic time sources.
//!
//! Two clocks: the PIT tick counter (coarse, 1 kHz, incremented by the
//! timer interrupt) and the CPU timestamp counter (fine-grained, used for
//! time slices and protocol timeouts).  Both are monotonic; neither is
//! wall-clock time.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TSC_TICKS_PER_MS;

/// Ticks since boot, incremented once per timer interrupt.
static BOOT_TICKS: AtomicU64 = AtomicU64::new(0);

/// Read the CPU timestamp counter.
pub fn read_tsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Fine-grained monotonic time, in TSC ticks.
pub fn now() -> u64 {
    read_tsc()
}

/// Called from the timer interrupt.
pub fn tick() {
    BOOT_TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Timer ticks since boot.
pub fn boot_ticks() -> u64 {
    BOOT_TICKS.load(Ordering::Relaxed)
}

/// Convert milliseconds to TSC ticks.
pub const fn ms_to_ticks(ms: u64) -> u64 {
    ms * TSC_TICKS_PER_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsc_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn ms_conversion() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(50), 50 * TSC_TICKS_PER_MS);
    }
}
