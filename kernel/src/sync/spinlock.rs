//! IRQ-safe spinlock with automatic interrupt disable/restore.
//!
//! A test-and-set lock with CPU-pause backoff. Interrupts are disabled
//! before acquisition and the previous interrupt state is restored on drop,
//! so the timer cannot fire while a lock-protected critical section runs on
//! a single core.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// An IRQ-safe spinlock protecting data of type `T`.
pub struct Spinlock<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

/// RAII guard for a held [`Spinlock`].
///
/// On drop, releases the lock and restores the interrupt state saved at
/// acquisition time.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    irq_was_enabled: bool,
}

/// Check if interrupts are currently enabled (RFLAGS.IF, bit 9).
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    let flags: u64;
    unsafe {
        core::arch::asm!("pushfq; pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags & (1 << 9) != 0
}

#[inline(always)]
fn cli() {
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

#[inline(always)]
fn sti() {
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

impl<T> Spinlock<T> {
    /// Create a new unlocked spinlock wrapping the given data.
    pub const fn new(data: T) -> Self {
        Spinlock {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    ///
    /// Interrupts are disabled before spinning so an IRQ handler can never
    /// preempt the holder and spin on the same lock forever.
    pub fn lock(&self) -> SpinlockGuard<T> {
        let was_enabled = interrupts_enabled();
        cli();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinlockGuard { lock: self, irq_was_enabled: was_enabled }
    }

    /// Try to acquire the lock without blocking.
    ///
    /// Restores the saved interrupt state on failure.
    pub fn try_lock(&self) -> Option<SpinlockGuard<T>> {
        let was_enabled = interrupts_enabled();
        cli();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self, irq_was_enabled: was_enabled })
        } else {
            if was_enabled {
                sti();
            }
            None
        }
    }
}

impl<'a, T> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> SpinlockGuard<'a, T> {
    /// Release the lock WITHOUT restoring the saved interrupt state.
    ///
    /// The context-switch path acquires the lock, switches, and the resumed
    /// side must come back with interrupts still controlled by the restored
    /// RFLAGS, not by this guard.
    pub fn release_no_irq_restore(self) {
        self.lock.lock.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<'a, T> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.lock.store(false, Ordering::Release);
        // Restore interrupt state AFTER releasing: nested guards each saw
        // IF=0 and restore IF=0; only the outermost re-enables.
        if self.irq_was_enabled {
            sti();
        }
    }
}
