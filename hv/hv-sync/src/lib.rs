//! # Root-Mode Synchronisation Primitives
//!
//! The hypervisor runs on a single logical processor and all VM-exit
//! handlers run to completion, so its state needs no locking *by
//! construction*. Rust still wants proof: the process-wide state blocks
//! are globals, and globals must be `Sync`. [`SpinLock`] provides the
//! interior mutability with the cheapest possible proof, and [`IrqGuard`]
//! masks interrupts across the guest-side critical sections (protect
//! setup/teardown) that must not race a VM exit on the same CPU.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A tiny spinlock for short critical sections.
///
/// Suitable for uniprocessor root-mode code where critical sections are
/// short and never suspend. Does **not** disable interrupts by itself;
/// pair with [`IrqGuard`] where an interrupt handler could re-enter.
pub struct SpinLock<T> {
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// SAFETY: the lock enforces exclusive access, so sharing is sound whenever
// the inner value can be sent between threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock wrapping `inner`.
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }
}

/// RAII guard providing exclusive access to the locked value.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Saves the interrupt flag and executes `cli`; restores on drop.
///
/// Must only be constructed at CPL 0 where `cli`/`popf` are legal.
#[cfg(feature = "asm")]
pub struct IrqGuard {
    flags: usize,
}

#[cfg(feature = "asm")]
impl IrqGuard {
    /// Disable interrupts, remembering whether they were enabled.
    #[must_use]
    pub fn new() -> Self {
        let flags: usize;
        // SAFETY: reading EFLAGS/RFLAGS and clearing IF is side-effect free
        // beyond interrupt masking; the type restores the flag on drop.
        unsafe {
            core::arch::asm!(
                "pushf",
                "pop {0}",
                "cli",
                out(reg) flags,
                options(nomem, preserves_flags)
            );
        }
        Self { flags }
    }
}

#[cfg(feature = "asm")]
impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "asm")]
impl Drop for IrqGuard {
    fn drop(&mut self) {
        const IF: usize = 1 << 9;
        if self.flags & IF != 0 {
            // SAFETY: interrupts were enabled on entry; re-enabling restores
            // the saved state.
            unsafe {
                core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
            }
        }
    }
}
