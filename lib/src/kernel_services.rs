//! Contracts with the kernel services the timer subsystem depends on.
//!
//! The deferred-callback core has exactly three external collaborators, each
//! with a deliberately narrow surface:
//!
//! - the **interrupt controller**, which accepts a requested hard-tick
//!   period and calls the hard-interrupt entry point at that rate;
//! - the **bottom-half dispatcher**, which runs a requested bottom half once,
//!   on the requested PCPU, with interrupts enabled;
//! - the **scheduler**, which consumes a per-tick callback (and a slower
//!   stats callback) and may neither block nor call back into timer APIs.
//!
//! Each contract is a function pointer registered during bring-up.  Before
//! registration the defaults are inert: the controller reports zero cycles
//! remaining, the dispatcher drops the request (soft polls still evaluate
//! the wheel), and the scheduler callbacks are no-ops.  That keeps the
//! subsystem testable without a live platform underneath it.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Reprogram the hard-interrupt period; returns cycles remaining in the
/// period that was cut short.
pub type SetIntrPeriodFn = fn(cycles: u64) -> u64;

/// Request that the timer bottom half run once on `pcpu`.
pub type ScheduleBhFn = fn(pcpu: usize);

/// Per-tick callback: `(now_tc)`.  Must not block, must not re-enter the
/// timer API.
pub type TickFn = fn(now_tc: u64);

static SET_INTR_PERIOD_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static SCHEDULE_BH_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static SCHED_TICK_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static STATS_TICK_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

pub fn register_interrupt_controller(f: SetIntrPeriodFn) {
    SET_INTR_PERIOD_FN.store(f as *mut (), Ordering::Release);
}

pub fn register_bottom_half_dispatcher(f: ScheduleBhFn) {
    SCHEDULE_BH_FN.store(f as *mut (), Ordering::Release);
}

pub fn register_sched_tick(f: TickFn) {
    SCHED_TICK_FN.store(f as *mut (), Ordering::Release);
}

pub fn register_stats_tick(f: TickFn) {
    STATS_TICK_FN.store(f as *mut (), Ordering::Release);
}

/// Ask the interrupt controller for a new period, in time-source cycles.
/// Returns the cycles that remained in the old period (lost on reprogram).
#[inline]
pub fn set_interrupt_period(cycles: u64) -> u64 {
    let fn_ptr = SET_INTR_PERIOD_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return 0;
    }
    // SAFETY: stored exclusively by `register_interrupt_controller`.
    let f: SetIntrPeriodFn = unsafe { core::mem::transmute(fn_ptr) };
    f(cycles)
}

/// Ask the bottom-half dispatcher to run the timer bottom half on `pcpu`.
#[inline]
pub fn schedule_bottom_half(pcpu: usize) {
    let fn_ptr = SCHEDULE_BH_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return;
    }
    // SAFETY: stored exclusively by `register_bottom_half_dispatcher`.
    let f: ScheduleBhFn = unsafe { core::mem::transmute(fn_ptr) };
    f(pcpu);
}

/// Deliver the scheduler's per-tick callback.
#[inline]
pub fn sched_tick(now_tc: u64) {
    let fn_ptr = SCHED_TICK_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return;
    }
    // SAFETY: stored exclusively by `register_sched_tick`.
    let f: TickFn = unsafe { core::mem::transmute(fn_ptr) };
    f(now_tc);
}

/// Deliver the slow-path stats callback.
#[inline]
pub fn stats_tick(now_tc: u64) {
    let fn_ptr = STATS_TICK_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return;
    }
    // SAFETY: stored exclusively by `register_stats_tick`.
    let f: TickFn = unsafe { core::mem::transmute(fn_ptr) };
    f(now_tc);
}
