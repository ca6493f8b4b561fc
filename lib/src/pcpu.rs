//! Physical-CPU identity and per-PCPU layout helpers.
//!
//! The timer subsystem keys everything by PCPU index: each PCPU owns one
//! wheel, handles encode their owner, and cross-PCPU operations route by
//! that index.  How a PCPU learns its own index is platform business (LAPIC
//! ID mapping, GS-relative data, ...), so the resolver is a function pointer
//! registered by bring-up; before registration everything reports PCPU 0,
//! which is correct for the single-processor boot phase.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Maximum number of physical CPUs the subsystem is sized for.
///
/// Bounded by the PCPU field of the timer handle encoding; raising it means
/// widening that field.
pub const MAX_PCPUS: usize = 64;

/// Cache-line sized wrapper to keep per-PCPU slots from false sharing.
#[repr(C, align(64))]
pub struct CacheAligned<T>(pub T);

impl<T: Copy> Copy for CacheAligned<T> {}
impl<T: Clone> Clone for CacheAligned<T> {
    fn clone(&self) -> Self {
        CacheAligned(self.0.clone())
    }
}

static PCPU_ID_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Number of PCPUs brought online; 1 until bring-up reports otherwise.
static PCPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Register the platform's "which PCPU am I" resolver.
pub fn register_pcpu_id_fn(f: fn() -> usize) {
    PCPU_ID_FN.store(f as *mut (), Ordering::Release);
}

/// Index of the PCPU this code is running on.
///
/// Clamped into `0..MAX_PCPUS` so a misbehaving resolver cannot take the
/// caller out of bounds.
#[inline]
pub fn current_pcpu_id() -> usize {
    let fn_ptr = PCPU_ID_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return 0;
    }
    // SAFETY: only `register_pcpu_id_fn` stores here, always a valid
    // `fn() -> usize`.
    let f: fn() -> usize = unsafe { core::mem::transmute(fn_ptr) };
    f().min(MAX_PCPUS - 1)
}

/// Record the number of online PCPUs (called once by bring-up).
pub fn set_pcpu_count(count: usize) {
    let clamped = count.clamp(1, MAX_PCPUS) as u32;
    PCPU_COUNT.store(clamped, Ordering::Release);
}

#[inline]
pub fn pcpu_count() -> usize {
    PCPU_COUNT.load(Ordering::Acquire) as usize
}

/// Whether this is the bootstrap processor.
#[inline]
pub fn is_bsp() -> bool {
    current_pcpu_id() == 0
}
