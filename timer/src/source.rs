//! The monotonic time source behind every deadline.
//!
//! One of three implementations is selected at init and reached through a
//! single indirect call, so the hot path is one function pointer away from
//! the hardware:
//!
//! - **Tsc** — the processor timestamp counter plus a stored offset so the
//!   count starts at 0 at boot.  The default on shared-bus SMP.
//! - **CrossChip** — a shared 32-bit performance counter on a non-CPU-local
//!   chip, for NUMA machines whose TSCs diverge.  Extended in software to
//!   63 bits with a lock-free carry protocol (see [`extend_cross_chip`]).
//! - **FakeNuma** — the TSC divided by a small constant, used to exercise
//!   the divergent-TSC paths on hardware that does not have them.
//!
//! Reads before `init` return 0, matching the rest of the kernel's
//! "services return zero until wired" convention.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, Ordering};

use vexo_lib::pcpu::MAX_PCPUS;
use vexo_lib::{klog_info, tsc};

/// Which counter backs the time source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeSourceKind {
    Tsc = 0,
    CrossChip = 1,
    FakeNuma = 2,
}

/// Divisor for the FakeNuma source.
const FAKE_NUMA_DIVISOR: u64 = 8;

/// Fallback rate when neither bring-up nor CPUID can tell us (3 GHz).
const DEFAULT_TSC_HZ: u64 = 3_000_000_000;

type NowFn = fn() -> u64;
type CrossChipReadFn = fn() -> u32;

static NOW_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static KIND: AtomicU8 = AtomicU8::new(TimeSourceKind::Tsc as u8);

/// Offset added to raw TSC reads so `now()` starts at 0 and survives
/// hardware TSC resets (see [`correct_for_tsc_shift`]).
static SHIFT_TC: AtomicU64 = AtomicU64::new(0);

static CYCLES_PER_SEC: AtomicU64 = AtomicU64::new(0);

/// Per-PCPU rate estimates for machines with heterogeneous TSCs.  Seeded
/// with the global rate at init; bring-up overrides per PCPU, and the
/// pseudo-TSC reconciliation nudges them toward consensus.
static PCPU_HZ: [AtomicU64; MAX_PCPUS] = [const { AtomicU64::new(0) }; MAX_PCPUS];

/// Software extension of the 32-bit cross-chip counter.
static EXTENSION: AtomicU32 = AtomicU32::new(0);
static CROSS_CHIP_READ_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Register the reader for the cross-chip hardware counter.  Must happen
/// before `init(TimeSourceKind::CrossChip, ..)`.
pub fn register_cross_chip_counter(f: CrossChipReadFn) {
    CROSS_CHIP_READ_FN.store(f as *mut (), Ordering::Release);
}

/// Select the time source.  `hz` is the measured rate of the chosen counter;
/// pass 0 to fall back to the CPUID estimate (and 3 GHz after that).
pub fn init(kind: TimeSourceKind, hz: u64) {
    let hz = if hz != 0 {
        hz
    } else {
        let estimated = vexo_lib::cpu::estimate_tsc_hz();
        let raw = if estimated != 0 { estimated } else { DEFAULT_TSC_HZ };
        match kind {
            TimeSourceKind::FakeNuma => raw / FAKE_NUMA_DIVISOR,
            _ => raw,
        }
    };

    CYCLES_PER_SEC.store(hz, Ordering::Release);
    for slot in PCPU_HZ.iter() {
        slot.store(hz, Ordering::Relaxed);
    }
    KIND.store(kind as u8, Ordering::Release);

    let now_fn: NowFn = match kind {
        TimeSourceKind::Tsc => {
            SHIFT_TC.store(0u64.wrapping_sub(tsc::rdtsc()), Ordering::Release);
            tsc_now
        }
        TimeSourceKind::CrossChip => {
            EXTENSION.store(0, Ordering::Release);
            cross_chip_now
        }
        TimeSourceKind::FakeNuma => {
            SHIFT_TC.store(0u64.wrapping_sub(tsc::rdtsc() / FAKE_NUMA_DIVISOR), Ordering::Release);
            fake_numa_now
        }
    };
    NOW_FN.store(now_fn as *mut (), Ordering::Release);

    klog_info!("TIMER: time source {:?} at {} Hz", kind, hz);
}

/// Current time-source value.  0 before `init`.
#[inline]
pub fn now() -> u64 {
    let fn_ptr = NOW_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return 0;
    }
    // SAFETY: only `init` stores here, always a valid `fn() -> u64`.
    let f: NowFn = unsafe { core::mem::transmute(fn_ptr) };
    f()
}

/// Rate of the active source, in Hz.
#[inline]
pub fn cycles_per_second() -> u64 {
    CYCLES_PER_SEC.load(Ordering::Acquire)
}

pub fn kind() -> TimeSourceKind {
    match KIND.load(Ordering::Acquire) {
        1 => TimeSourceKind::CrossChip,
        2 => TimeSourceKind::FakeNuma,
        _ => TimeSourceKind::Tsc,
    }
}

/// Per-PCPU rate estimate.
#[inline]
pub fn pcpu_hz(pcpu: usize) -> u64 {
    PCPU_HZ[pcpu % MAX_PCPUS].load(Ordering::Acquire)
}

/// Record a per-PCPU rate (bring-up measurement or consensus adjustment).
pub fn set_pcpu_hz(pcpu: usize, hz: u64) {
    PCPU_HZ[pcpu % MAX_PCPUS].store(hz, Ordering::Release);
}

/// Compensate for a hardware TSC reset of `delta_tc` counts so that `now()`
/// stays monotonic.  The cross-chip counter does not live in the CPU and is
/// unaffected.
pub fn correct_for_tsc_shift(delta_tc: u64) {
    match kind() {
        TimeSourceKind::Tsc => {
            SHIFT_TC.fetch_add(delta_tc, Ordering::AcqRel);
        }
        TimeSourceKind::FakeNuma => {
            SHIFT_TC.fetch_add(delta_tc / FAKE_NUMA_DIVISOR, Ordering::AcqRel);
        }
        TimeSourceKind::CrossChip => {}
    }
}

fn tsc_now() -> u64 {
    tsc::rdtsc().wrapping_add(SHIFT_TC.load(Ordering::Acquire))
}

fn fake_numa_now() -> u64 {
    (tsc::rdtsc() / FAKE_NUMA_DIVISOR).wrapping_add(SHIFT_TC.load(Ordering::Acquire))
}

fn cross_chip_now() -> u64 {
    let fn_ptr = CROSS_CHIP_READ_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return 0;
    }
    // SAFETY: only `register_cross_chip_counter` stores here.
    let f: CrossChipReadFn = unsafe { core::mem::transmute(fn_ptr) };
    extend_cross_chip(f(), &EXTENSION)
}

/// Extend a 32-bit hardware counter reading to 63 bits.
///
/// `extension` is a software high half whose low bit normally mirrors bit 31
/// of the hardware counter.  When they disagree the counter has crossed a
/// 2^31 boundary since the extension was last published:
///
/// - bit 30 clear: we are early in the new half-period, so publish the
///   incremented extension;
/// - bit 30 set: another CPU already published the increment for a crossing
///   our read predates (the race-loser case), so use `extension - 1` locally
///   and publish nothing.
///
/// The extension must be refreshed at least once per `2^30 / rate` seconds;
/// the hard tick guarantees that by reading `now()` on every interrupt.
///
/// All racing writers compute the same value, so the store needs no
/// read-modify-write; Release keeps it ordered after the counter read it was
/// derived from.
pub(crate) fn extend_cross_chip(hw: u32, extension: &AtomicU32) -> u64 {
    let ext = extension.load(Ordering::Acquire);
    let mut high = ext;
    if (ext & 1) != (hw >> 31) {
        if hw & (1 << 30) == 0 {
            high = ext.wrapping_add(1);
            extension.store(high, Ordering::Release);
        } else {
            high = ext.wrapping_sub(1);
        }
    }
    ((high as u64) << 31) | (hw & 0x7FFF_FFFF) as u64
}
