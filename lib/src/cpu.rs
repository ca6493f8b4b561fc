//! The small set of CPU intrinsics the timer stack needs.
//!
//! Unlike a full kernel HAL this is deliberately narrow: spin hints, the
//! irqsave/irqrestore pair used by [`IrqMutex`](crate::spinlock::IrqMutex),
//! and the CPUID frequency leaf consulted when bring-up does not hand us a
//! measured TSC rate.

use core::arch::asm;

/// Spin-loop hint (PAUSE).
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}

/// Halt until the next interrupt.
#[inline(always)]
pub fn hlt() {
    unsafe {
        asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// Enable interrupts (STI).
#[inline(always)]
pub fn enable_interrupts() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Save RFLAGS and disable interrupts.  The returned value is opaque to the
/// caller and must be handed back to [`restore_flags`].
#[inline(always)]
pub fn save_flags_cli() -> u64 {
    let flags: u64;
    unsafe {
        asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem)
        );
    }
    flags
}

/// Restore the interrupt flag from a [`save_flags_cli`] snapshot.  Interrupts
/// are re-enabled only if IF was set when the snapshot was taken.
#[inline(always)]
pub fn restore_flags(flags: u64) {
    const IF_BIT: u64 = 1 << 9;
    if flags & IF_BIT != 0 {
        enable_interrupts();
    }
}

/// Whether interrupts are currently enabled on this CPU.
#[inline(always)]
pub fn interrupts_enabled() -> bool {
    let flags: u64;
    unsafe {
        asm!("pushfq; pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags & (1 << 9) != 0
}

/// Execute CPUID for `leaf`, returning (eax, ebx, ecx, edx).
#[inline(always)]
pub fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let res = core::arch::x86_64::__cpuid(leaf);
    (res.eax, res.ebx, res.ecx, res.edx)
}

/// CPUID leaf 0x16: processor base frequency enumeration.
const CPUID_LEAF_FREQ: u32 = 0x16;

/// Estimate the TSC rate from CPUID leaf 0x16, in Hz.
///
/// Returns 0 when the leaf is not implemented or reports nothing; callers
/// fall back to a conservative default.  Bring-up code should prefer a
/// measured rate — this exists so the subsystem can still run on hardware
/// where no calibration reference was available.
pub fn estimate_tsc_hz() -> u64 {
    let (max_leaf, _, _, _) = cpuid(0);
    if max_leaf < CPUID_LEAF_FREQ {
        return 0;
    }
    let (base_mhz, _, _, _) = cpuid(CPUID_LEAF_FREQ);
    base_mhz as u64 * 1_000_000
}
