#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod cpu;
pub mod ports;

/// Raw timestamp-counter access.
///
/// This is the *unadjusted* hardware counter; the boot-relative shift that
/// makes the subsystem clock start at zero lives with the time-source
/// selection in the timer crate.  Three things read it: the Tsc and
/// FakeNuma time sources behind `source::now()`, the pseudo-TSC offset
/// resync (which must sample the local TSC, not the selected time source),
/// and the suite harness's elapsed-time measurement in
/// `define_test_suite!`.
pub mod tsc {
    use core::arch::asm;

    /// Read the TSC.  RDTSC writes EDX:EAX; merge into one u64.
    #[inline(always)]
    pub fn rdtsc() -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            asm!(
                "rdtsc",
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        ((hi as u64) << 32) | (lo as u64)
    }
}

pub mod init_flag;
pub mod kernel_services;
pub mod klog;
pub mod pcpu;
pub mod spinlock;
pub mod testing;

#[doc(hidden)]
pub use paste;

pub use init_flag::{InitFlag, StateFlag};
pub use klog::{
    KlogLevel, klog_get_level, klog_init, klog_is_enabled, klog_register_backend, klog_set_level,
};
pub use pcpu::{
    CacheAligned, MAX_PCPUS, current_pcpu_id, pcpu_count, register_pcpu_id_fn, set_pcpu_count,
};
pub use ports::COM1_BASE;
pub use spinlock::{IrqMutex, IrqMutexGuard};
