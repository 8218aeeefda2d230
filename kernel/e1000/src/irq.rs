//! An interrupt-safe mutex for state shared between the e1000's interrupt handler and normal code.
//!
//! The receive path runs inside the interrupt handler and may transmit from there,
//! so both queues must be locked with interrupts masked on the current CPU;
//! otherwise the handler could interrupt a holder of the lock it is about to take, and spin forever.
//!
//! Masking is performed by the platform's [`InterruptControl`], supplied at initialization.

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

/// How the platform masks and unmasks interrupts on the current CPU.
pub trait InterruptControl: Send + Sync {
    /// Masks interrupts on the current CPU, returning whether they were enabled beforehand.
    fn disable_interrupts(&self) -> bool;
    /// Unmasks interrupts on the current CPU.
    fn enable_interrupts(&self);
}

/// A guard type for ensuring interrupts are disabled.
///
/// When dropped, interrupts are re-enabled only if they were enabled when this was created.
pub struct HeldInterrupts<'a> {
    irq: &'a dyn InterruptControl,
    was_enabled: bool,
}

/// Masks interrupts on the current CPU until the returned guard is dropped.
pub fn hold_interrupts(irq: &dyn InterruptControl) -> HeldInterrupts<'_> {
    let was_enabled = irq.disable_interrupts();
    HeldInterrupts { irq, was_enabled }
}

impl Drop for HeldInterrupts<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.irq.enable_interrupts();
        }
    }
}


/// A spinlock that keeps interrupts masked on the current CPU for as long as it is held.
pub struct MutexIrqSafe<T> {
    irq: &'static dyn InterruptControl,
    inner: Mutex<T>,
}

impl<T> MutexIrqSafe<T> {
    pub fn new(data: T, irq: &'static dyn InterruptControl) -> MutexIrqSafe<T> {
        MutexIrqSafe { irq, inner: Mutex::new(data) }
    }

    /// Masks interrupts, then spins until the lock is acquired.
    pub fn lock(&self) -> MutexIrqSafeGuard<'_, T> {
        let held_irq = hold_interrupts(self.irq);
        MutexIrqSafeGuard { guard: self.inner.lock(), _held_irq: held_irq }
    }

    /// Tries to acquire the lock once; interrupts are left as they were if it is already held.
    pub fn try_lock(&self) -> Option<MutexIrqSafeGuard<'_, T>> {
        let held_irq = hold_interrupts(self.irq);
        let guard = self.inner.try_lock()?;
        Some(MutexIrqSafeGuard { guard, _held_irq: held_irq })
    }
}

/// The guard of a [`MutexIrqSafe`]. The lock is released before interrupts are restored.
pub struct MutexIrqSafeGuard<'a, T> {
    // fields are dropped in declaration order
    guard: MutexGuard<'a, T>,
    _held_irq: HeldInterrupts<'a>,
}

impl<T> Deref for MutexIrqSafeGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MutexIrqSafeGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
