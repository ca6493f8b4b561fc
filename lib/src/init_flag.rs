//! One-way and re-enterable boot flags.
//!
//! [`InitFlag`] answers "has this been initialized yet" with a single
//! monotonic transition; [`StateFlag`] marks a region some CPU is currently
//! inside (init critical sections, POST phases).

use core::sync::atomic::{AtomicBool, Ordering};

/// A flag that transitions unset → set once and stays set.
pub struct InitFlag {
    set: AtomicBool,
}

impl InitFlag {
    #[inline]
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
        }
    }

    /// Attempt the unset → set transition.  Returns `true` for exactly one
    /// caller; losers see `false` and must not run the guarded init path.
    #[inline]
    pub fn init_once(&self) -> bool {
        self.set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Set unconditionally (single-threaded boot paths).
    #[inline]
    pub fn mark_set(&self) {
        self.set.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Relaxed read for hot paths that only need a hint.
    #[inline]
    pub fn is_set_relaxed(&self) -> bool {
        self.set.load(Ordering::Relaxed)
    }

    /// Clear the flag (error unwind during bring-up).
    #[inline]
    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// A flag marking a region currently being executed by some CPU.
pub struct StateFlag {
    active: AtomicBool,
}

impl StateFlag {
    #[inline]
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    /// Try to enter the region.  Returns `false` if another CPU is inside.
    #[inline]
    pub fn enter(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn leave(&self) {
        self.active.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Default for StateFlag {
    fn default() -> Self {
        Self::new()
    }
}
