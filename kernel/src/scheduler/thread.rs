//! Thread definition.
//!
//! A thread owns a kernel stack, a saved register snapshot, and a TLS
//! region, and belongs to exactly one process.  The back-reference to the
//! owning process is a `Weak` handle: the process owns its threads, the
//! thread can only observe whether its process is still alive.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::process::Process;
use crate::gdt::{KERNEL_CS, KERNEL_DS};

/// Shared handle to a thread.
pub type ThreadRef = Arc<Mutex<Thread>>;

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Dead,
}

/// Full CPU register snapshot, in the layout the interrupt entry path
/// pushes it.
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct RegisterState {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub interrupt_vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Per-thread accounting.
#[derive(Debug, Default, Clone)]
pub struct ThreadStats {
    /// CPU time consumed, in TSC ticks.
    pub cpu_time: u64,
    /// Times this thread was switched in.
    pub context_switches: u64,
    /// Monotonic time of the last schedule.
    pub last_scheduled: u64,
    /// Monotonic creation time.
    pub created_at: u64,
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// A schedulable thread.
pub struct Thread {
    id: u64,
    pid: u64,
    process: Weak<Mutex<Process>>,
    pub(super) state: ThreadState,
    priority: u32,
    entry_point: u64,
    stack_base: u64,
    stack_size: usize,
    tls_base: u64,
    tls_size: usize,
    pub registers: RegisterState,
    pub(super) sleep_until: u64,
    pub(super) stats: ThreadStats,
}

impl Thread {
    /// Build a thread over an already-allocated stack.  The spawner owns
    /// stack allocation; `stack_base == 0` means "no stack yet" (the idle
    /// thread and test threads).
    pub fn new(
        pid: u64,
        process: Weak<Mutex<Process>>,
        entry_point: u64,
        stack_base: u64,
        stack_size: usize,
        now: u64,
    ) -> Thread {
        let mut registers = RegisterState::default();
        registers.rip = entry_point;
        if stack_base != 0 {
            // Leave a red zone at the stack top.
            registers.rsp = stack_base + stack_size as u64 - 128;
        }
        registers.cs = KERNEL_CS as u64;
        registers.ss = KERNEL_DS as u64;
        registers.rflags = 0x202; // IF set

        Thread {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            process,
            state: ThreadState::Created,
            priority: 1,
            entry_point,
            stack_base,
            stack_size,
            tls_base: 0,
            tls_size: 0,
            registers,
            sleep_until: 0,
            stats: ThreadStats {
                created_at: now,
                ..ThreadStats::default()
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn process(&self) -> Option<Arc<Mutex<Process>>> {
        self.process.upgrade()
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Scheduling priority: 0 is highest, 3 lowest.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority.min(crate::config::SCHED_BANDS as u32 - 1);
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    pub fn stack_base(&self) -> u64 {
        self.stack_base
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn set_tls(&mut self, base: u64, size: usize) {
        self.tls_base = base;
        self.tls_size = size;
    }

    pub fn tls_base(&self) -> u64 {
        self.tls_base
    }

    pub fn tls_size(&self) -> usize {
        self.tls_size
    }

    pub fn is_sleeping(&self) -> bool {
        self.state == ThreadState::Sleeping
    }

    pub fn sleep_until(&self) -> u64 {
        self.sleep_until
    }

    pub fn set_sleep_until(&mut self, wake_time: u64) {
        self.sleep_until = wake_time;
    }

    /// Whether a sleeping thread's deadline has passed.
    pub fn should_wake(&self, now: u64) -> bool {
        self.is_sleeping() && now >= self.sleep_until
    }

    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_register_seed() {
        let t = Thread::new(7, Weak::new(), 0x1234, 0x8000_0000, 0x4000, 0);
        assert_eq!(t.state(), ThreadState::Created);
        assert_eq!(t.registers.rip, 0x1234);
        assert_eq!(t.registers.rsp, 0x8000_0000 + 0x4000 - 128);
        assert_eq!(t.registers.cs, KERNEL_CS as u64);
        assert_eq!(t.registers.rflags, 0x202);
        assert_eq!(t.pid(), 7);
    }

    #[test]
    fn thread_ids_are_unique() {
        let a = Thread::new(1, Weak::new(), 0, 0, 0, 0);
        let b = Thread::new(1, Weak::new(), 0, 0, 0, 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn wake_deadline() {
        let mut t = Thread::new(1, Weak::new(), 0, 0, 0, 0);
        t.set_state(ThreadState::Sleeping);
        t.set_sleep_until(100);
        assert!(!t.should_wake(99));
        assert!(t.should_wake(100));
        assert!(t.should_wake(150));

        t.set_state(ThreadState::Ready);
        assert!(!t.should_wake(150));
    }

    #[test]
    fn register_state_layout() {
        // The interrupt entry path depends on this exact layout.
        assert_eq!(core::mem::offset_of!(RegisterState, r15), 0x00);
        assert_eq!(core::mem::offset_of!(RegisterState, rax), 0x70);
        assert_eq!(core::mem::offset_of!(RegisterState, rip), 0x88);
        assert_eq!(core::mem::offset_of!(RegisterState, rsp), 0xA0);
        assert_eq!(core::mem::offset_of!(RegisterState, ss), 0xA8);
    }
}
