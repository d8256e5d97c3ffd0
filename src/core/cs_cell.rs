//! Critical section protected cell
//!
//! Manager, handle and backend state all live in one of these.

use core::cell::UnsafeCell;
use crate::critical::CriticalSection;

/// A cell that can only be accessed within a critical section.
///
/// Callers must not hold the returned reference across a call that may
/// re-enter the owner of the cell (a backend call or a user callback).
pub struct CsCell<T>(UnsafeCell<T>);

// SAFETY: the inner value is only reachable through `get`, which requires
// proof that interrupts are masked.
unsafe impl<T> Sync for CsCell<T> {}

impl<T> CsCell<T> {
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Get a mutable reference to the inner value
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub fn get(&self, _cs: &CriticalSection) -> &mut T {
        // SAFETY: see the `Sync` impl; re-entrancy is the caller's contract.
        unsafe { &mut *self.0.get() }
    }
}
