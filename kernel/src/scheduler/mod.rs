//! Preemptive thread scheduler.
//!
//! Single CPU, four priority bands (band 0 highest), round-robin within a
//! band.  Preemption points are the timer tick, voluntary `yield_now`, and
//! `sleep`.  Exactly one thread is Running at any quiescent moment: the
//! scheduler's current pointer references it and it lives in no run queue.
//! Every other non-idle thread that is Ready or Sleeping sits in exactly
//! one band; sleeping threads are promoted in place when their deadline
//! passes.
//!
//! The run queues are protected by the interrupt-disabling spinlock; the
//! tick handler runs in interrupt context and takes the same lock.

pub mod context;
pub mod policy;
pub mod process;
pub mod thread;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{SCHED_BANDS, TIME_SLICE_DEFAULT, TSC_TICKS_PER_MS};
use crate::kernel_singleton;

pub use policy::SchedulingPolicy;
pub use process::{ProcessRef, ProcessState};
pub use thread::{Thread, ThreadRef, ThreadState};

/// Global scheduler accounting.
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub total_context_switches: u64,
    pub total_threads_scheduled: u64,
    pub total_cpu_time: u64,
    pub idle_time: u64,
    pub last_switch_time: u64,
}

/// One priority band: a FIFO of threads plus a round-robin cursor.
struct RunQueue {
    threads: Vec<ThreadRef>,
    cursor: usize,
    level: u32,
}

/// The scheduler.
pub struct Scheduler {
    run_queues: Vec<RunQueue>,
    idle_thread: Option<ThreadRef>,
    current_thread: Option<ThreadRef>,
    policy: SchedulingPolicy,
    time_slice_default: u64,
    last_schedule_time: u64,
    timer_ticks: u64,
    stats: SchedulerStats,
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            run_queues: Vec::new(),
            idle_thread: None,
            current_thread: None,
            policy: SchedulingPolicy::RoundRobin,
            time_slice_default: TIME_SLICE_DEFAULT,
            last_schedule_time: 0,
            timer_ticks: 0,
            stats: SchedulerStats {
                total_context_switches: 0,
                total_threads_scheduled: 0,
                total_cpu_time: 0,
                idle_time: 0,
                last_switch_time: 0,
            },
        }
    }

    fn ensure_queues(&mut self) {
        if self.run_queues.is_empty() {
            for level in 0..SCHED_BANDS as u32 {
                self.run_queues.push(RunQueue {
                    threads: Vec::new(),
                    cursor: 0,
                    level,
                });
            }
        }
    }

    /// Install the idle thread and make it current.  Called once at init.
    pub fn install_idle(&mut self, thread: ThreadRef, now: u64) {
        self.ensure_queues();
        thread.lock().set_state(ThreadState::Running);
        self.idle_thread = Some(thread.clone());
        self.current_thread = Some(thread);
        self.last_schedule_time = now;
        self.stats.last_switch_time = now;
    }

    fn is_idle(&self, thread: &ThreadRef) -> bool {
        self.idle_thread
            .as_ref()
            .is_some_and(|idle| Arc::ptr_eq(idle, thread))
    }

    /// A thread is schedulable unless it is dead or its process is gone.
    fn validate(thread: &ThreadRef) -> bool {
        let t = thread.lock();
        if t.state() == ThreadState::Dead {
            return false;
        }
        match t.process() {
            Some(process) => {
                let p = process.lock();
                !p.is_dead() && !p.is_zombie()
            }
            None => false,
        }
    }

    fn band_of(&self, thread: &ThreadRef) -> usize {
        let t = thread.lock();
        let proc_cpu = t
            .process()
            .map(|p| p.lock().stats().cpu_time_used)
            .unwrap_or(0);
        policy::band_for(self.policy, t.priority(), proc_cpu, self.stats.total_cpu_time)
    }

    fn enqueue(&mut self, band: usize, thread: ThreadRef) {
        self.ensure_queues();
        let band = band.min(SCHED_BANDS - 1);
        self.run_queues[band].threads.push(thread);
    }

    /// Make a thread schedulable.
    pub fn add_thread(&mut self, thread: ThreadRef) {
        if !Self::validate(&thread) {
            crate::error!("SCHED", "refusing to add invalid thread {}", thread.lock().id());
            return;
        }
        let band = self.band_of(&thread);
        thread.lock().set_state(ThreadState::Ready);
        crate::debug!(
            "SCHED",
            "added thread {} to priority band {}",
            thread.lock().id(),
            band
        );
        self.enqueue(band, thread);
    }

    /// Drop a thread from the run queues.
    pub fn remove_thread(&mut self, thread: &ThreadRef) {
        for queue in &mut self.run_queues {
            if let Some(pos) = queue.threads.iter().position(|t| Arc::ptr_eq(t, thread)) {
                queue.threads.remove(pos);
                if queue.cursor > pos {
                    queue.cursor -= 1;
                }
            }
        }
        if let Some(ref current) = self.current_thread {
            if Arc::ptr_eq(current, thread) {
                self.current_thread = self.idle_thread.clone();
            }
        }
    }

    fn queued(&self, thread: &ThreadRef) -> bool {
        self.run_queues
            .iter()
            .any(|q| q.threads.iter().any(|t| Arc::ptr_eq(t, thread)))
    }

    /// Pick the next thread: scan bands top to bottom, rotating each
    /// band's cursor.  Ready threads are taken as-is; sleeping threads
    /// whose deadline passed are promoted and taken.  Falls back to the
    /// idle thread.
    fn select_next(&mut self, now: u64) -> Option<ThreadRef> {
        self.cleanup_dead();

        for band in 0..self.run_queues.len() {
            let len = self.run_queues[band].threads.len();
            if len == 0 {
                continue;
            }
            self.run_queues[band].cursor %= len;

            for i in 0..len {
                let pos = (self.run_queues[band].cursor + i) % len;
                let candidate = self.run_queues[band].threads[pos].clone();

                if !Self::validate(&candidate) {
                    continue;
                }
                let take = {
                    let mut t = candidate.lock();
                    match t.state() {
                        ThreadState::Ready => true,
                        ThreadState::Sleeping if t.should_wake(now) => {
                            t.set_state(ThreadState::Ready);
                            true
                        }
                        _ => false,
                    }
                };
                if take {
                    let queue = &mut self.run_queues[band];
                    queue.threads.remove(pos);
                    queue.cursor = if queue.threads.is_empty() {
                        0
                    } else {
                        pos % queue.threads.len()
                    };
                    return Some(candidate);
                }
            }
        }

        self.idle_thread.clone()
    }

    /// Bookkeeping half of a context switch: requeue the outgoing thread,
    /// charge its CPU time, activate the incoming thread and its address
    /// space.  The register-level switch is the architecture glue's job
    /// (`context::switch_context`), driven from the interrupt return path.
    fn switch_to(&mut self, next: ThreadRef, now: u64) {
        if let Some(ref current) = self.current_thread {
            if Arc::ptr_eq(current, &next) {
                return;
            }
        }

        let elapsed = now.saturating_sub(self.last_schedule_time);
        if let Some(old) = self.current_thread.take() {
            if self.is_idle(&old) {
                self.stats.idle_time += elapsed;
                old.lock().set_state(ThreadState::Ready);
            } else {
                let (requeue, band) = {
                    let mut t = old.lock();
                    t.stats.cpu_time += elapsed;
                    let proc_cpu = match t.process() {
                        Some(process) => {
                            let mut p = process.lock();
                            p.update_statistics(elapsed);
                            p.stats().cpu_time_used
                        }
                        None => 0,
                    };
                    self.stats.total_cpu_time += elapsed;

                    if t.state() == ThreadState::Running {
                        t.set_state(ThreadState::Ready);
                        let band = policy::band_for(
                            self.policy,
                            t.priority(),
                            proc_cpu,
                            self.stats.total_cpu_time,
                        );
                        (true, band)
                    } else {
                        // The thread went Sleeping/Blocked/Dead in the same
                        // critical section; its queue membership was
                        // already arranged.
                        (false, 0)
                    }
                };
                if requeue {
                    self.enqueue(band, old);
                }
            }
        }

        let space = {
            let mut t = next.lock();
            t.set_state(ThreadState::Running);
            t.stats.context_switches += 1;
            t.stats.last_scheduled = now;
            t.process().and_then(|p| p.lock().address_space().cloned())
        };
        if let Some(space) = space {
            crate::memory::switch_address_space(&space);
        }

        if !self.is_idle(&next) {
            self.stats.total_threads_scheduled += 1;
        }
        crate::trace!("SCHED", "context switch to thread {}", next.lock().id());
        self.current_thread = Some(next);
        self.last_schedule_time = now;
        self.stats.total_context_switches += 1;
        self.stats.last_switch_time = now;
    }

    /// Voluntary preemption point.
    pub fn yield_now(&mut self, now: u64) {
        let Some(current) = self.current_thread.clone() else {
            return;
        };
        if self.is_idle(&current) {
            return;
        }
        if let Some(next) = self.select_next(now) {
            self.switch_to(next, now);
        }
    }

    /// Put the current thread to sleep for `ms` milliseconds and run
    /// something else.
    pub fn sleep_current(&mut self, now: u64, ms: u64) {
        let Some(current) = self.current_thread.clone() else {
            return;
        };
        if self.is_idle(&current) {
            return;
        }

        {
            let mut t = current.lock();
            t.set_sleep_until(now + ms * TSC_TICKS_PER_MS);
            t.set_state(ThreadState::Sleeping);
        }
        // Sleeping threads live in their band until woken.
        let band = self.band_of(&current);
        self.enqueue(band, current);

        if let Some(next) = self.select_next(now) {
            self.switch_to(next, now);
        }
    }

    /// Wake a sleeping thread early.  No-op for any other state.
    pub fn wake_up(&mut self, thread: &ThreadRef) {
        {
            let mut t = thread.lock();
            if t.state() != ThreadState::Sleeping {
                return;
            }
            t.set_state(ThreadState::Ready);
        }
        if !self.queued(thread) {
            let band = self.band_of(thread);
            self.enqueue(band, thread.clone());
        }
        crate::debug!("SCHED", "woke up thread {}", thread.lock().id());
    }

    /// Timer tick: wake due sleepers, then preempt the current thread if
    /// its policy slice is spent.  The idle thread is always preemptible.
    pub fn handle_timer_tick(&mut self, now: u64) {
        self.timer_ticks += 1;

        for queue in &self.run_queues {
            for thread in &queue.threads {
                let mut t = thread.lock();
                if t.should_wake(now) {
                    t.set_state(ThreadState::Ready);
                }
            }
        }

        let Some(current) = self.current_thread.clone() else {
            return;
        };

        let expired = if self.is_idle(&current) {
            true
        } else {
            let t = current.lock();
            let slice = policy::time_slice_for(self.policy, self.time_slice_default, t.priority());
            now.saturating_sub(self.last_schedule_time) > slice
        };

        if expired {
            if let Some(next) = self.select_next(now) {
                self.switch_to(next, now);
            }
        }

        self.cleanup_dead();
    }

    /// Reap dead threads and threads of vanished processes from the run
    /// queues.
    fn cleanup_dead(&mut self) {
        let mut current_died = false;
        if let Some(ref current) = self.current_thread {
            if current.lock().state() == ThreadState::Dead {
                current_died = true;
            }
        }
        if current_died {
            if let Some(idle) = self.idle_thread.clone() {
                idle.lock().set_state(ThreadState::Running);
                self.current_thread = Some(idle);
            }
        }

        for queue in &mut self.run_queues {
            let cursor = queue.cursor;
            let mut removed_before_cursor = 0;
            let mut index = 0;
            queue.threads.retain(|t| {
                let keep =
                    t.lock().state() != ThreadState::Dead && t.lock().process().is_some();
                if !keep && index < cursor {
                    removed_before_cursor += 1;
                }
                index += 1;
                keep
            });
            queue.cursor = cursor.saturating_sub(removed_before_cursor);
        }
    }

    // ── Introspection ───────────────────────────────────────

    pub fn current_thread(&self) -> Option<ThreadRef> {
        self.current_thread.clone()
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: SchedulingPolicy) {
        self.policy = policy;
    }

    pub fn set_time_slice(&mut self, slice: u64) {
        self.time_slice_default = slice;
    }

    pub fn timer_ticks(&self) -> u64 {
        self.timer_ticks
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }

    pub fn ready_count(&self) -> usize {
        self.run_queues.iter().map(|q| q.threads.len()).sum()
    }

    pub fn dump_run_queues(&self) {
        crate::info!("SCHED", "run queues:");
        for queue in &self.run_queues {
            crate::info!(
                "SCHED",
                "  band {}: {} threads",
                queue.level,
                queue.threads.len()
            );
        }
    }
}

// ── Global instance ─────────────────────────────────────────

kernel_singleton!(SCHEDULER, SpinLock, Scheduler, Scheduler::new(), with_scheduler);

/// Initialize the scheduler: create the idle process and its thread and
/// make it current.  Failure here is fatal.
pub fn init() {
    let idle_process = match process::create_process("idle", 0) {
        Some(p) => p,
        None => crate::fatal!("SCHED", "failed to create idle process"),
    };
    idle_process.lock().set_state(ProcessState::Running);
    process::set_kernel_process(idle_process.clone());

    let idle_thread = match idle_process.lock().main_thread() {
        Some(t) => t,
        None => crate::fatal!("SCHED", "idle process has no main thread"),
    };

    let now = crate::time::now();
    with_scheduler(|s| s.install_idle(idle_thread, now));
    crate::info!("SCHED", "scheduler initialized with {} priority bands", SCHED_BANDS);
}

/// Timer interrupt entry.
pub fn on_timer_tick() {
    let now = crate::time::now();
    with_scheduler(|s| s.handle_timer_tick(now));
}

/// Voluntary yield from thread context.  Safe to call before the
/// scheduler is up; it degrades to a spin hint.
pub fn yield_now() {
    let now = crate::time::now();
    let scheduled = with_scheduler(|s| {
        if s.idle_thread.is_none() {
            return false;
        }
        s.yield_now(now);
        true
    });
    if !scheduled {
        core::hint::spin_loop();
    }
}

/// Sleep the current thread for `ms` milliseconds.
pub fn sleep(ms: u64) {
    let now = crate::time::now();
    with_scheduler(|s| s.sleep_current(now, ms));
}

/// Wake a sleeping thread.
pub fn wake_up(thread: &ThreadRef) {
    with_scheduler(|s| s.wake_up(thread));
}

/// Enqueue a thread for scheduling.
pub fn add_thread(thread: ThreadRef) {
    with_scheduler(|s| s.add_thread(thread));
}

/// The thread currently holding the CPU.
pub fn current_thread() -> Option<ThreadRef> {
    with_scheduler(|s| s.current_thread())
}

/// The process of the current thread.
pub fn current_process() -> Option<ProcessRef> {
    current_thread().and_then(|t| t.lock().process())
}

/// Select the scheduling policy.
pub fn set_policy(policy: SchedulingPolicy) {
    with_scheduler(|s| s.set_policy(policy));
}

/// Snapshot of the global scheduling statistics.
pub fn stats() -> SchedulerStats {
    with_scheduler(|s| s.stats())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a scheduler with an idle thread plus `n` ready worker
    /// threads, all backed by real processes and heap stacks.
    fn setup(n: usize) -> (Scheduler, Vec<ThreadRef>) {
        crate::memory::init_for_tests(0x100000, 0x1800000);

        let mut s = Scheduler::new();
        let idle_proc = process::create_process("idle", 0).unwrap();
        idle_proc.lock().set_state(ProcessState::Running);
        let idle = idle_proc.lock().main_thread().unwrap();
        s.install_idle(idle, 0);

        let mut threads = Vec::new();
        for i in 0..n {
            let p = process::create_process(&std::format!("worker{}", i), 1).unwrap();
            let t = p.lock().main_thread().unwrap();
            s.add_thread(t.clone());
            threads.push(t);
            // Keep the ProcessRef alive through the manager table.
        }
        (s, threads)
    }

    fn running_count(threads: &[ThreadRef]) -> usize {
        threads
            .iter()
            .filter(|t| t.lock().state() == ThreadState::Running)
            .count()
    }

    #[test]
    fn round_robin_schedules_everyone() {
        let (mut s, threads) = setup(3);
        s.set_time_slice(10);

        let mut seen = [0u64; 3];
        let mut now = 0;
        for _ in 0..30 {
            now += 11;
            s.handle_timer_tick(now);
            for (i, t) in threads.iter().enumerate() {
                if t.lock().state() == ThreadState::Running {
                    seen[i] += 1;
                }
            }
        }
        for (i, count) in seen.iter().enumerate() {
            assert!(*count > 0, "thread {} was never scheduled", i);
        }
    }

    #[test]
    fn exactly_one_running_thread() {
        let (mut s, threads) = setup(4);
        s.set_time_slice(10);

        let mut now = 0;
        for _ in 0..20 {
            now += 11;
            s.handle_timer_tick(now);
            let mut running = running_count(&threads);
            // The idle thread counts when no worker holds the CPU.
            let current = s.current_thread().unwrap();
            if s.is_idle(&current) {
                running += 1;
            }
            assert_eq!(running, 1);
        }
    }

    #[test]
    fn two_thread_round_robin_slice_accounting() {
        // Two ready threads, 1 ms slice, 5 ms of ticks: each runs about
        // twice and at least 4 context switches happened.
        let (mut s, threads) = setup(2);
        s.set_time_slice(crate::time::ms_to_ticks(1));

        let tick = crate::time::ms_to_ticks(1) + 1;
        let mut now = 0;
        for _ in 0..5 {
            now += tick;
            s.handle_timer_tick(now);
        }

        let runs_a = threads[0].lock().stats().context_switches;
        let runs_b = threads[1].lock().stats().context_switches;
        assert!(runs_a >= 1 && runs_b >= 1);
        assert!((runs_a as i64 - runs_b as i64).abs() <= 1);
        assert!(s.stats().total_context_switches >= 4);
    }

    #[test]
    fn sleeping_thread_not_scheduled_before_deadline() {
        let (mut s, threads) = setup(2);
        s.set_time_slice(10);

        let mut now = 100;
        s.handle_timer_tick(now); // brings a worker in
        let sleeper = s.current_thread().unwrap();
        s.sleep_current(now, 50);

        assert_eq!(sleeper.lock().state(), ThreadState::Sleeping);

        // 1 ms of monotonic time per tick: for 49 ticks the sleeper must
        // never run.
        let step = crate::time::ms_to_ticks(1);
        for _ in 0..49 {
            now += step;
            s.handle_timer_tick(now);
            assert_ne!(sleeper.lock().state(), ThreadState::Running);
        }

        // The deadline passes at tick 50; with round-robin the thread runs
        // again within a few switches.
        let mut ran = false;
        for _ in 0..4 {
            now += step;
            s.handle_timer_tick(now);
            if sleeper.lock().state() == ThreadState::Running {
                ran = true;
                break;
            }
        }
        assert!(ran, "woken thread was not rescheduled");
        let _ = threads;
    }

    #[test]
    fn sleep_runs_other_ready_thread_or_idle() {
        let (mut s, threads) = setup(2);
        s.set_time_slice(10);

        let mut now = 50;
        s.handle_timer_tick(now);
        let first = s.current_thread().unwrap();
        s.sleep_current(now, 1000);

        // The other worker (not the sleeper) got the CPU.
        let current = s.current_thread().unwrap();
        assert!(!Arc::ptr_eq(&current, &first));
        assert_eq!(current.lock().state(), ThreadState::Running);

        now += 11;
        s.handle_timer_tick(now);
        let _ = threads;
    }

    #[test]
    fn wake_up_is_noop_for_non_sleeping() {
        let (mut s, threads) = setup(1);
        let t = &threads[0];
        assert_eq!(t.lock().state(), ThreadState::Ready);
        s.wake_up(t);
        assert_eq!(t.lock().state(), ThreadState::Ready);
    }

    #[test]
    fn wake_up_promotes_sleeper_early() {
        let (mut s, _threads) = setup(2);
        let mut now = 10;
        s.handle_timer_tick(now);
        let sleeper = s.current_thread().unwrap();
        s.sleep_current(now, 10_000);
        assert_eq!(sleeper.lock().state(), ThreadState::Sleeping);

        s.wake_up(&sleeper);
        assert_eq!(sleeper.lock().state(), ThreadState::Ready);

        // It is schedulable again without waiting for the deadline.
        let mut ran = false;
        for _ in 0..4 {
            now += 11;
            s.handle_timer_tick(now);
            if sleeper.lock().state() == ThreadState::Running {
                ran = true;
                break;
            }
        }
        assert!(ran);
    }

    #[test]
    fn dead_threads_are_skipped_and_reaped() {
        let (mut s, threads) = setup(2);
        threads[0].lock().set_state(ThreadState::Dead);

        let mut now = 0;
        for _ in 0..4 {
            now += 11;
            s.handle_timer_tick(now);
            assert_ne!(threads[0].lock().state(), ThreadState::Running);
        }
        // The dead thread is gone from the queues.
        assert!(!s.queued(&threads[0]));
    }

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        let (mut s, threads) = setup(1);
        let mut now = 0;
        now += 11;
        s.handle_timer_tick(now);
        assert!(Arc::ptr_eq(&s.current_thread().unwrap(), &threads[0]));

        // Only thread goes to sleep; idle takes over.
        s.sleep_current(now, 10_000);
        let current = s.current_thread().unwrap();
        assert!(s.is_idle(&current));
        assert_eq!(current.lock().state(), ThreadState::Running);
    }

    #[test]
    fn priority_policy_prefers_higher_band() {
        crate::memory::init_for_tests(0x100000, 0x1800000);

        let mut s = Scheduler::new();
        let idle_proc = process::create_process("idle", 0).unwrap();
        idle_proc.lock().set_state(ProcessState::Running);
        s.install_idle(idle_proc.lock().main_thread().unwrap(), 0);
        s.set_policy(SchedulingPolicy::Priority);
        s.set_time_slice(10);

        let high_proc = process::create_process("high", 1).unwrap();
        let high = high_proc.lock().main_thread().unwrap();
        high.lock().set_priority(0);

        let low_proc = process::create_process("low", 1).unwrap();
        let low = low_proc.lock().main_thread().unwrap();
        low.lock().set_priority(3);

        s.add_thread(low.clone());
        s.add_thread(high.clone());

        s.handle_timer_tick(11);
        assert!(Arc::ptr_eq(&s.current_thread().unwrap(), &high));

    }

    #[test]
    fn stack_allocation_failure_fails_thread_creation() {
        // A tiny region: enough for paging structures but not for a 64 KiB
        // stack.
        crate::memory::init_for_tests(0x100000, 0x10000);
        assert!(process::create_process("nostack", 0).is_none());
    }
}
