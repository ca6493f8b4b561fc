//! Interrupt-context tests for the deferred-callback core.
//!
//! These drive the real per-PCPU wheels through the public API, using
//! soft polls to stand in for the bottom-half dispatcher.  They run on the
//! boot PCPU from the in-kernel harness, after `timer::init`.

use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use vexo_lib::pcpu::current_pcpu_id;
use vexo_lib::testing::TestResult;
use vexo_lib::{assert_eq_test, assert_test, cpu, define_test_suite, pass};

use crate::handle::TimerHandle;
use crate::timer::{self, TimerConfig};
use crate::{rate, source, tick};

fn ensure_init() {
    // Idempotent; a no-op when bring-up already initialized the module.
    timer::init(&TimerConfig::default());
}

fn poll_for(budget_us: u64, done: impl Fn() -> bool) -> bool {
    let deadline_tc = source::now().wrapping_add(rate::us_to_tc(budget_us));
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

// =============================================================================
// One-shot basics
// =============================================================================

static ONE_SHOT_FIRED: AtomicU32 = AtomicU32::new(0);

fn one_shot_cb(_data: *mut c_void, _now_tc: u64) {
    ONE_SHOT_FIRED.fetch_add(1, Ordering::Relaxed);
}

pub fn test_one_shot_fires_once() -> TestResult {
    ensure_init();
    ONE_SHOT_FIRED.store(0, Ordering::Relaxed);

    let handle = timer::add_ms(10, false, one_shot_cb, core::ptr::null_mut());
    assert_test!(timer::pending(handle), "armed timer is pending");

    assert_test!(
        poll_for(50_000, || ONE_SHOT_FIRED.load(Ordering::Relaxed) == 1),
        "one-shot fires within budget"
    );
    assert_test!(!timer::pending(handle), "fired one-shot is no longer pending");

    // Give it plenty of chances to misfire a second time.
    poll_for(15_000, || false);
    assert_eq_test!(ONE_SHOT_FIRED.load(Ordering::Relaxed), 1, "fires exactly once");
    assert_test!(!timer::remove(handle), "stale handle removal returns false");

    pass!()
}

pub fn test_stale_handle_operations_fail() -> TestResult {
    ensure_init();

    let handle = timer::add_ms(500, false, one_shot_cb, core::ptr::null_mut());
    assert_test!(timer::get_timeout(handle).is_some(), "live handle snapshots");
    assert_test!(timer::remove(handle), "armed timer removes immediately");

    assert_test!(!timer::pending(handle), "pending false after remove");
    assert_test!(!timer::remove(handle), "double remove fails");
    assert_test!(!timer::modify(handle, source::now(), 0), "modify of stale handle fails");
    assert_test!(timer::get_timeout(handle).is_none(), "snapshot of stale handle fails");
    assert_test!(!timer::pending(TimerHandle::INVALID), "handle zero is never pending");

    pass!()
}

// =============================================================================
// Periodic rate
// =============================================================================

static PERIODIC_FIRED: AtomicU32 = AtomicU32::new(0);

fn periodic_cb(_data: *mut c_void, _now_tc: u64) {
    PERIODIC_FIRED.fetch_add(1, Ordering::Relaxed);
}

pub fn test_periodic_rate_over_100ms() -> TestResult {
    ensure_init();
    PERIODIC_FIRED.store(0, Ordering::Relaxed);

    let handle = timer::add_hires(1_000, true, periodic_cb, core::ptr::null_mut());
    poll_for(100_000, || false);
    let fired = PERIODIC_FIRED.load(Ordering::Relaxed);
    timer::remove(handle);

    assert_test!(
        (95..=105).contains(&fired),
        "1 ms periodic fired {} times in 100 ms",
        fired
    );

    pass!()
}

// =============================================================================
// Ordering (staggered one-shots)
// =============================================================================

const STAGGER_COUNT: u32 = 64;
static STAGGER_FIRED: AtomicU32 = AtomicU32::new(0);
static STAGGER_LAST_DEADLINE: AtomicU64 = AtomicU64::new(0);
static STAGGER_ORDER_VIOLATIONS: AtomicU32 = AtomicU32::new(0);

fn stagger_cb(data: *mut c_void, _now_tc: u64) {
    let deadline_tc = data as u64;
    let last = STAGGER_LAST_DEADLINE.swap(deadline_tc, Ordering::Relaxed);
    if deadline_tc < last {
        STAGGER_ORDER_VIOLATIONS.fetch_add(1, Ordering::Relaxed);
    }
    STAGGER_FIRED.fetch_add(1, Ordering::Relaxed);
}

pub fn test_staggered_one_shots_fire_in_order() -> TestResult {
    ensure_init();
    STAGGER_FIRED.store(0, Ordering::Relaxed);
    STAGGER_LAST_DEADLINE.store(0, Ordering::Relaxed);
    STAGGER_ORDER_VIOLATIONS.store(0, Ordering::Relaxed);

    let pcpu = current_pcpu_id();
    let overdue_before = timer::wheel(pcpu).lock().stats.overdue_dropped;

    let now_tc = source::now();
    for i in 0..STAGGER_COUNT {
        let deadline_tc = now_tc.wrapping_add(rate::us_to_tc((i as u64 + 1) * 200));
        timer::add(pcpu, stagger_cb, deadline_tc as *mut c_void, deadline_tc, 0);
    }

    assert_test!(
        poll_for(100_000, || {
            STAGGER_FIRED.load(Ordering::Relaxed) == STAGGER_COUNT
        }),
        "all staggered one-shots fire"
    );
    assert_eq_test!(
        STAGGER_ORDER_VIOLATIONS.load(Ordering::Relaxed),
        0,
        "firing order follows deadlines"
    );

    let overdue_after = timer::wheel(pcpu).lock().stats.overdue_dropped;
    assert_eq_test!(overdue_after, overdue_before, "no overdue drops for one-shots");

    pass!()
}

// =============================================================================
// Modify from inside the callback
// =============================================================================

const MODIFY_SAMPLES: usize = 8;
static MODIFY_HANDLE: AtomicU64 = AtomicU64::new(0);
static MODIFY_COUNT: AtomicU32 = AtomicU32::new(0);
static MODIFY_TIMES: [AtomicU64; MODIFY_SAMPLES] = [const { AtomicU64::new(0) }; MODIFY_SAMPLES];

fn modify_cb(_data: *mut c_void, now_tc: u64) {
    let n = MODIFY_COUNT.fetch_add(1, Ordering::Relaxed) as usize;
    if n < MODIFY_SAMPLES {
        MODIFY_TIMES[n].store(now_tc, Ordering::Relaxed);
    }
    if n == 2 {
        // Re-aim our own period from 2 ms to 5 ms, mid-callback.
        let handle = TimerHandle::from_raw(MODIFY_HANDLE.load(Ordering::Relaxed));
        let period_tc = rate::us_to_tc(5_000);
        timer::modify(handle, now_tc.wrapping_add(period_tc), period_tc);
    }
}

pub fn test_modify_period_from_own_callback() -> TestResult {
    ensure_init();
    MODIFY_COUNT.store(0, Ordering::Relaxed);

    let handle = timer::add_hires(2_000, true, modify_cb, core::ptr::null_mut());
    MODIFY_HANDLE.store(handle.raw(), Ordering::Relaxed);

    assert_test!(
        poll_for(120_000, || {
            MODIFY_COUNT.load(Ordering::Relaxed) as usize >= MODIFY_SAMPLES
        }),
        "periodic timer keeps firing across the modify"
    );
    timer::remove(handle);

    // The cycle in flight when modify ran still used the old period; the
    // ones after it approach the new 5 ms spacing.
    let floor_tc = rate::us_to_tc(4_000);
    for i in 4..MODIFY_SAMPLES - 1 {
        let a = MODIFY_TIMES[i].load(Ordering::Relaxed);
        let b = MODIFY_TIMES[i + 1].load(Ordering::Relaxed);
        assert_test!(
            b.wrapping_sub(a) >= floor_tc,
            "interval {} after modify is {} tc, floor {}",
            i,
            b.wrapping_sub(a),
            floor_tc
        );
    }

    pass!()
}

// =============================================================================
// Remove from inside the callback
// =============================================================================

static SELF_REMOVE_COUNT: AtomicU32 = AtomicU32::new(0);
static SELF_REMOVE_HANDLE: AtomicU64 = AtomicU64::new(0);

fn self_remove_cb(_data: *mut c_void, _now_tc: u64) {
    SELF_REMOVE_COUNT.fetch_add(1, Ordering::Relaxed);
    let handle = TimerHandle::from_raw(SELF_REMOVE_HANDLE.load(Ordering::Relaxed));
    // Our slot is FIRING, so the free is deferred and this returns false.
    timer::remove(handle);
}

pub fn test_remove_own_timer_from_callback() -> TestResult {
    ensure_init();
    SELF_REMOVE_COUNT.store(0, Ordering::Relaxed);

    let handle = timer::add_hires(1_000, true, self_remove_cb, core::ptr::null_mut());
    SELF_REMOVE_HANDLE.store(handle.raw(), Ordering::Relaxed);

    assert_test!(
        poll_for(50_000, || SELF_REMOVE_COUNT.load(Ordering::Relaxed) >= 1),
        "callback runs"
    );
    assert_test!(
        poll_for(20_000, || !timer::pending(handle)),
        "self-removed timer goes stale"
    );

    poll_for(10_000, || false);
    assert_eq_test!(
        SELF_REMOVE_COUNT.load(Ordering::Relaxed),
        1,
        "periodic stops after removing itself"
    );

    pass!()
}

// =============================================================================
// Groups
// =============================================================================

static GROUP_FIRED: AtomicU32 = AtomicU32::new(0);

fn group_cb(_data: *mut c_void, _now_tc: u64) {
    GROUP_FIRED.fetch_add(1, Ordering::Relaxed);
}

pub fn test_group_removal_is_atomic_per_wheel() -> TestResult {
    ensure_init();
    GROUP_FIRED.store(0, Ordering::Relaxed);

    let pcpu = current_pcpu_id();
    let group = timer::create_group(pcpu);
    let now_tc = source::now();
    let far_tc = now_tc.wrapping_add(rate::us_to_tc(500_000));

    let mut grouped = [TimerHandle::INVALID; 3];
    for slot in grouped.iter_mut() {
        *slot = timer::add_group(pcpu, group, group_cb, core::ptr::null_mut(), far_tc, 0);
    }
    let loner = timer::add(pcpu, group_cb, core::ptr::null_mut(), far_tc, 0);

    timer::remove_group(group);

    for &h in &grouped {
        assert_test!(!timer::pending(h), "grouped timer removed");
    }
    assert_test!(timer::pending(loner), "ungrouped timer survives");
    timer::remove(loner);

    assert_eq_test!(GROUP_FIRED.load(Ordering::Relaxed), 0, "nothing fired");

    pass!()
}

// =============================================================================
// Interrupt-period tunable
// =============================================================================

pub fn test_period_change_reprograms_once() -> TestResult {
    ensure_init();
    let pcpu = current_pcpu_id();
    let original_us = timer::interrupt_period_us();

    let sets_before = timer::wheel(pcpu).lock().stats.period_sets;

    timer::set_interrupt_period_us(original_us * 2);
    tick::interrupt();
    let sets_after_first = timer::wheel(pcpu).lock().stats.period_sets;
    assert_eq_test!(sets_after_first, sets_before + 1, "first tick reprograms");

    tick::interrupt();
    tick::interrupt();
    let sets_after_more = timer::wheel(pcpu).lock().stats.period_sets;
    assert_eq_test!(sets_after_more, sets_before + 1, "no reprogram without a change");

    timer::set_interrupt_period_us(original_us);
    tick::interrupt();
    let sets_restored = timer::wheel(pcpu).lock().stats.period_sets;
    assert_eq_test!(sets_restored, sets_before + 2, "restore reprograms once more");

    pass!()
}

// =============================================================================
// Snapshots
// =============================================================================

pub fn test_get_timeout_snapshots_deadline_and_period() -> TestResult {
    ensure_init();

    let period_tc = rate::us_to_tc(10_000);
    let deadline_tc = source::now().wrapping_add(period_tc);
    let handle = timer::add(
        current_pcpu_id(),
        one_shot_cb,
        core::ptr::null_mut(),
        deadline_tc,
        period_tc,
    );

    let Some((got_deadline, got_period)) = timer::get_timeout(handle) else {
        return fail_snapshot();
    };
    timer::remove(handle);

    assert_eq_test!(got_deadline, deadline_tc, "deadline snapshot");
    assert_eq_test!(got_period, period_tc, "period snapshot");

    pass!()
}

fn fail_snapshot() -> TestResult {
    vexo_lib::fail!("get_timeout on a live handle")
}

define_test_suite!(
    timer_core,
    [
        test_one_shot_fires_once,
        test_stale_handle_operations_fail,
        test_periodic_rate_over_100ms,
        test_staggered_one_shots_fire_in_order,
        test_modify_period_from_own_callback,
        test_remove_own_timer_from_callback,
        test_group_removal_is_atomic_per_wheel,
        test_period_change_reprograms_once,
        test_get_timeout_snapshots_deadline_and_period,
    ]
);
