//! Kernel locking primitives.
//!
//! Two disciplines, per the concurrency model:
//!
//! - [`SpinLock`] protects short critical sections that interrupt handlers
//!   also enter (frame allocator, page tables, scheduler run queues).
//!   Acquisition disables interrupts on this CPU; release restores them.
//!   A spinlock must never be held across a suspension point.
//! - [`Mutex`] protects state touched only from thread context (socket
//!   tables, fragment buffers).  Contended acquisition yields to the
//!   scheduler instead of burning the time slice.
//!
//! Under `cargo test` the interrupt manipulation is compiled out: tests run
//! in user mode where `cli`/`sti` would fault, and the spin semantics alone
//! are what the tests exercise.

use core::ops::{Deref, DerefMut};

/// Interrupt-disabling spinlock.
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

/// Guard for [`SpinLock`]; restores the interrupt flag on drop.
pub struct SpinLockGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    reenable: bool,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquire the lock, disabling interrupts for the critical section.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        #[cfg(not(test))]
        let reenable = {
            let enabled = x86_64::instructions::interrupts::are_enabled();
            if enabled {
                x86_64::instructions::interrupts::disable();
            }
            enabled
        };
        #[cfg(test)]
        let reenable = false;

        SpinLockGuard {
            guard: Some(self.inner.lock()),
            reenable,
        }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts.
        self.guard.take();
        #[cfg(not(test))]
        if self.reenable {
            x86_64::instructions::interrupts::enable();
        }
        #[cfg(test)]
        let _ = self.reenable;
    }
}

/// Yielding mutex for thread-context state.
pub struct Mutex<T> {
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquire the lock, yielding the CPU while contended.
    pub fn lock(&self) -> spin::MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            crate::scheduler::yield_now();
        }
    }

    pub fn try_lock(&self) -> Option<spin::MutexGuard<'_, T>> {
        self.inner.try_lock()
    }
}

/// Define a kernel-wide singleton behind the named lock discipline, with a
/// `with_*` accessor.
///
/// In the kernel image the storage is a static behind [`SpinLock`] or
/// [`Mutex`]; under `cargo test` each test thread gets its own instance so
/// tests cannot interfere through shared global state.
#[macro_export]
macro_rules! kernel_singleton {
    ($store:ident, $lock:ident, $ty:ty, $init:expr, $vis:vis $with:ident) => {
        #[cfg(not(test))]
        static $store: $crate::sync::$lock<$ty> = $crate::sync::$lock::new($init);

        #[cfg(not(test))]
        $vis fn $with<R>(f: impl FnOnce(&mut $ty) -> R) -> R {
            f(&mut *$store.lock())
        }

        #[cfg(test)]
        std::thread_local! {
            static $store: core::cell::RefCell<$ty> = core::cell::RefCell::new($init);
        }

        #[cfg(test)]
        $vis fn $with<R>(f: impl FnOnce(&mut $ty) -> R) -> R {
            $store.with(|cell| f(&mut *cell.borrow_mut()))
        }
    };
}
