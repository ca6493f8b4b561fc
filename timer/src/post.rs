//! Power-on self-test of timer behavior.
//!
//! One test world per PCPU calls [`run`] during bring-up.  The worlds meet
//! at a spin barrier so every wheel is exercised concurrently, then each
//! PCPU checks, against its own wheel:
//!
//! 1. a ~1 ms periodic timer accumulates at least 10 firings within 100×
//!    its period;
//! 2. a batch of staggered one-shots all fire, each inside its
//!    `[deadline, deadline + slack]` window, and the aggregate count
//!    matches.
//!
//! Waiting is done by driving [`tick::soft_poll`], so POST also proves the
//! soft-timer discipline: timers fire from bottom-half evaluation alone,
//! with no dependency on the hard interrupt being wired yet.
//!
//! A failure is reported to bring-up (log + return value); it does not
//! abort the kernel.

use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use vexo_lib::pcpu::{CacheAligned, MAX_PCPUS, current_pcpu_id};
use vexo_lib::{cpu, klog_info, klog_warn};

use crate::handle::TimerHandle;
use crate::{rate, source, tick, timer};

/// Period of the periodic-timer test.
const PERIODIC_US: u64 = 1_000;

/// Firings the periodic test must reach.
const PERIODIC_MIN_FIRINGS: u64 = 10;

/// Wait budget for the periodic test, as a multiple of the period.
const PERIODIC_WAIT_FACTOR: u64 = 100;

/// One-shot batch size per PCPU.
const BATCH_COUNT: usize = 32;

/// Stagger between consecutive one-shot deadlines.
const BATCH_STEP_US: u64 = 500;

/// How late a one-shot may fire before POST calls it a failure.
const BATCH_SLACK_US: u64 = 10_000;

struct PostCell {
    fired: AtomicU64,
    out_of_window: AtomicU64,
}

static CELLS: [CacheAligned<PostCell>; MAX_PCPUS] = [const {
    CacheAligned(PostCell {
        fired: AtomicU64::new(0),
        out_of_window: AtomicU64::new(0),
    })
}; MAX_PCPUS];

static BARRIER_ARRIVED: AtomicU32 = AtomicU32::new(0);
static BARRIER_GENERATION: AtomicU32 = AtomicU32::new(0);

fn barrier_wait(total: u32) {
    let generation = BARRIER_GENERATION.load(Ordering::Acquire);
    if BARRIER_ARRIVED.fetch_add(1, Ordering::AcqRel) + 1 == total {
        BARRIER_ARRIVED.store(0, Ordering::Relaxed);
        BARRIER_GENERATION.fetch_add(1, Ordering::Release);
    } else {
        while BARRIER_GENERATION.load(Ordering::Acquire) == generation {
            cpu::pause();
        }
    }
}

fn periodic_cb(_data: *mut c_void, _now_tc: u64) {
    CELLS[current_pcpu_id()].0.fired.fetch_add(1, Ordering::Relaxed);
}

/// One-shot callback: `data` carries the timer's expected deadline.
fn one_shot_cb(data: *mut c_void, now_tc: u64) {
    let cell = &CELLS[current_pcpu_id()].0;
    let expected_tc = data as u64;
    let upper_tc = expected_tc.wrapping_add(rate::us_to_tc(BATCH_SLACK_US));
    if now_tc < expected_tc || now_tc > upper_tc {
        cell.out_of_window.fetch_add(1, Ordering::Relaxed);
    }
    cell.fired.fetch_add(1, Ordering::Relaxed);
}

/// Drive soft polls until `done` or the deadline passes.
fn poll_until(deadline_tc: u64, done: impl Fn() -> bool) -> bool {
    loop {
        if done() {
            return true;
        }
        if source::now() >= deadline_tc {
            return done();
        }
        tick::soft_poll();
        cpu::pause();
    }
}

fn reset_cell(pcpu: usize) {
    CELLS[pcpu].0.fired.store(0, Ordering::Relaxed);
    CELLS[pcpu].0.out_of_window.store(0, Ordering::Relaxed);
}

fn periodic_test(pcpu: usize) -> bool {
    reset_cell(pcpu);
    let period_tc = rate::us_to_tc(PERIODIC_US);
    let handle = timer::add(
        pcpu,
        periodic_cb,
        core::ptr::null_mut(),
        source::now().wrapping_add(period_tc),
        period_tc,
    );

    let budget_tc = source::now().wrapping_add(period_tc * PERIODIC_WAIT_FACTOR);
    let reached = poll_until(budget_tc, || {
        CELLS[pcpu].0.fired.load(Ordering::Relaxed) >= PERIODIC_MIN_FIRINGS
    });
    timer::remove(handle);

    if !reached {
        klog_warn!(
            "POST: PCPU {} periodic timer fired {} times, wanted {}",
            pcpu,
            CELLS[pcpu].0.fired.load(Ordering::Relaxed),
            PERIODIC_MIN_FIRINGS,
        );
    }
    reached
}

fn one_shot_test(pcpu: usize) -> bool {
    reset_cell(pcpu);
    let now_tc = source::now();
    let mut handles = [TimerHandle::INVALID; BATCH_COUNT];
    for (i, slot) in handles.iter_mut().enumerate() {
        let deadline_tc = now_tc.wrapping_add(rate::us_to_tc((i as u64 + 1) * BATCH_STEP_US));
        *slot = timer::add(pcpu, one_shot_cb, deadline_tc as *mut c_void, deadline_tc, 0);
    }

    let last_tc = now_tc.wrapping_add(rate::us_to_tc(BATCH_COUNT as u64 * BATCH_STEP_US));
    let budget_tc = last_tc.wrapping_add(rate::us_to_tc(2 * BATCH_SLACK_US));
    let all_fired = poll_until(budget_tc, || {
        CELLS[pcpu].0.fired.load(Ordering::Relaxed) >= BATCH_COUNT as u64
    });

    // Stragglers would leak slots; sweep them regardless of the verdict.
    for &h in &handles {
        timer::remove(h);
    }

    let fired = CELLS[pcpu].0.fired.load(Ordering::Relaxed);
    let late = CELLS[pcpu].0.out_of_window.load(Ordering::Relaxed);
    if !all_fired || late != 0 {
        klog_warn!(
            "POST: PCPU {} one-shot batch fired {}/{} with {} outside the window",
            pcpu,
            fired,
            BATCH_COUNT,
            late,
        );
        return false;
    }
    true
}

/// Run the self-test on the calling PCPU, synchronized with the other
/// `total_pcpus` test worlds.  Returns whether both phases passed.
pub fn run(total_pcpus: usize) -> bool {
    assert!(timer::is_initialized(), "POST: timer module not initialized");
    let pcpu = current_pcpu_id();
    let total = total_pcpus.max(1) as u32;

    barrier_wait(total);
    let periodic_ok = periodic_test(pcpu);

    barrier_wait(total);
    let one_shot_ok = one_shot_test(pcpu);

    barrier_wait(total);
    let passed = periodic_ok && one_shot_ok;
    if passed {
        klog_info!("POST: PCPU {} timer self-test passed", pcpu);
    } else {
        klog_warn!("POST: PCPU {} timer self-test FAILED", pcpu);
    }
    passed
}
