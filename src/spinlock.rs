//! A minimal test-and-set spin lock.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::{relax::Spin, RelaxStrategy};

/// One-word mutual exclusion with no fairness and no guard type.
///
/// The reader-release path of the wait queue unlocks in non-lexical order
/// (own lock first, then the predecessor's), so this exposes raw
/// [`lock`](SpinMutex::lock)/[`unlock`](SpinMutex::unlock) instead of RAII.
/// Hold times are bounded by a constant number of pointer fixups.
pub(crate) struct SpinMutex {
    locked: AtomicBool,
}

impl SpinMutex {
    #[inline]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the flag is taken.
    ///
    /// The `Acquire` swap pairs with the `Release` store in [`unlock`]; all
    /// writes made under the lock are visible to the next holder.
    ///
    /// [`unlock`]: SpinMutex::unlock
    #[inline]
    pub fn lock(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            Spin::relax();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}
