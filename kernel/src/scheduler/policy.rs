//! Scheduling policies.
//!
//! The policy decides two things: which priority band a thread lands in
//! when enqueued, and how long its time slice is.  Band 0 is the highest
//! priority; the selector scans bands top to bottom.

use crate::config::SCHED_BANDS;

/// Pluggable scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Everything shares band 1 with a fixed slice.
    RoundRobin,
    /// The thread's assigned priority selects the band; lower priorities
    /// get shorter slices.
    Priority,
    /// Band 0 with a double-length slice.
    RealTime,
    /// Band from the process's share of total CPU time: processes that
    /// have run less bubble up into higher-priority bands.
    Fair,
}

/// Band for a thread under `policy`.
///
/// `proc_cpu_time` and `total_cpu_time` feed the fair policy; the others
/// ignore them.
pub fn band_for(
    policy: SchedulingPolicy,
    thread_priority: u32,
    proc_cpu_time: u64,
    total_cpu_time: u64,
) -> usize {
    let band = match policy {
        SchedulingPolicy::RoundRobin => 1,
        SchedulingPolicy::Priority => thread_priority as usize,
        SchedulingPolicy::RealTime => 0,
        SchedulingPolicy::Fair => {
            ((proc_cpu_time.saturating_mul(SCHED_BANDS as u64)) / (total_cpu_time + 1)) as usize
        }
    };
    band.min(SCHED_BANDS - 1)
}

/// Time slice for a thread under `policy`, in TSC ticks.
pub fn time_slice_for(policy: SchedulingPolicy, base_slice: u64, thread_priority: u32) -> u64 {
    match policy {
        SchedulingPolicy::RoundRobin => base_slice,
        SchedulingPolicy::Priority => {
            let priority = (thread_priority as u64).min(SCHED_BANDS as u64 - 1);
            base_slice * (SCHED_BANDS as u64 - priority) / SCHED_BANDS as u64
        }
        SchedulingPolicy::RealTime => base_slice * 2,
        SchedulingPolicy::Fair => base_slice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_uses_band_one() {
        assert_eq!(band_for(SchedulingPolicy::RoundRobin, 0, 0, 0), 1);
        assert_eq!(band_for(SchedulingPolicy::RoundRobin, 3, 500, 100), 1);
    }

    #[test]
    fn priority_band_tracks_thread_priority() {
        for p in 0..4 {
            assert_eq!(band_for(SchedulingPolicy::Priority, p, 0, 0), p as usize);
        }
        // Out-of-range priorities clamp to the lowest band.
        assert_eq!(band_for(SchedulingPolicy::Priority, 99, 0, 0), 3);
    }

    #[test]
    fn realtime_gets_top_band_and_double_slice() {
        assert_eq!(band_for(SchedulingPolicy::RealTime, 3, 0, 0), 0);
        assert_eq!(
            time_slice_for(SchedulingPolicy::RealTime, 1000, 3),
            2000
        );
    }

    #[test]
    fn fair_band_scales_with_cpu_share() {
        // A process that never ran stays in the top band.
        assert_eq!(band_for(SchedulingPolicy::Fair, 0, 0, 1000), 0);
        // A process that consumed everything sinks to the bottom.
        assert_eq!(band_for(SchedulingPolicy::Fair, 0, 1000, 1000), 3);
        // Half the CPU lands in the middle.
        assert_eq!(band_for(SchedulingPolicy::Fair, 0, 500, 1000), 1);
    }

    #[test]
    fn priority_slice_shrinks_with_lower_priority() {
        let base = 4000;
        let s0 = time_slice_for(SchedulingPolicy::Priority, base, 0);
        let s3 = time_slice_for(SchedulingPolicy::Priority, base, 3);
        assert_eq!(s0, base);
        assert_eq!(s3, base / 4);
        assert!(s0 > s3);
    }
}
