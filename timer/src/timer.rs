//! Public timer API and process-wide state.
//!
//! Every operation routes to the owning PCPU's wheel through the handle's
//! PCPU bits, takes that wheel's lock, mutates, and returns.  Nothing here
//! blocks: the only waiting primitive is the bounded spin in
//! [`remove_sync`].
//!
//! Error policy follows the kernel convention: a stale handle is a normal
//! race outcome and reported by a `false`/`None` return; everything else —
//! adding before init, a period below the floor, slab exhaustion, a
//! synchronous remove from the owning PCPU — is a programming error and
//! panics.

use core::ffi::c_void;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use vexo_lib::pcpu::{CacheAligned, MAX_PCPUS, current_pcpu_id, pcpu_count, set_pcpu_count};
use vexo_lib::spinlock::IrqMutex;
use vexo_lib::{InitFlag, cpu, klog_info, klog_warn};

use crate::handle::TimerHandle;
use crate::rate;
use crate::source::{self, TimeSourceKind};
use crate::wheel::{MAX_TIMERS, NUM_SPOKES, TimerCallback, TimerWheel};

/// Floor on periodic timer periods, in µs.  Callbacks shorter than this
/// would starve the bottom half.
pub const TIMER_MIN_PERIOD_US: u64 = 100;

/// Default hard-interrupt period, in µs.
pub const DEFAULT_PERIOD_US: u32 = 1000;

/// Jiffies advance every 10 ms.
const JIFFY_PERIOD_US: u64 = 10_000;

/// The stats callback runs about once a second.
const STATS_PERIOD_US: u64 = 1_000_000;

/// remove_sync spins this many iterations between warnings.
const SYNC_SPINS_PER_WARNING: u32 = 1_000_000;

/// After this many warnings the FIRING timer is declared stuck.
const SYNC_MAX_WARNINGS: u32 = 10;

// ---------------------------------------------------------------------------
// Process-wide state
// ---------------------------------------------------------------------------

static WHEELS: [CacheAligned<IrqMutex<TimerWheel>>; MAX_PCPUS] = {
    const WHEEL: CacheAligned<IrqMutex<TimerWheel>> =
        CacheAligned(IrqMutex::new(TimerWheel::new()));
    [WHEEL; MAX_PCPUS]
};

static MODULE_READY: InitFlag = InitFlag::new();
static INIT_ONCE: InitFlag = InitFlag::new();

/// Low-resolution monotonic counter, +1 every 10 ms, exported to legacy
/// callers for coarse waits.
static JIFFIES: AtomicU64 = AtomicU64::new(0);

/// Wall time = this offset + now() converted to µs.
static TOD_OFFSET_US: AtomicI64 = AtomicI64::new(0);

/// The one tunable: requested hard-interrupt period.  The next hard tick on
/// each PCPU notices a change and reprograms its controller.
static DESIRED_PERIOD_US: AtomicU32 = AtomicU32::new(DEFAULT_PERIOD_US);

#[inline]
pub(crate) fn wheel(pcpu: usize) -> &'static IrqMutex<TimerWheel> {
    &WHEELS[pcpu].0
}

#[inline]
pub(crate) fn desired_period_us() -> u32 {
    DESIRED_PERIOD_US.load(Ordering::Acquire)
}

#[inline]
pub(crate) fn bump_jiffies() {
    JIFFIES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn min_period_tc() -> u64 {
    rate::us_to_tc(TIMER_MIN_PERIOD_US)
}

// ---------------------------------------------------------------------------
// Configuration and init
// ---------------------------------------------------------------------------

/// Bring-up parameters for the subsystem.
#[derive(Clone, Copy, Debug)]
pub struct TimerConfig {
    pub source: TimeSourceKind,
    /// Measured rate of the time source; 0 lets the subsystem estimate.
    pub cycles_per_second: u64,
    pub pcpu_count: usize,
    /// Hard-interrupt period in µs; 0 selects the default.
    pub interrupt_period_us: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            source: TimeSourceKind::Tsc,
            cycles_per_second: 0,
            pcpu_count: 1,
            interrupt_period_us: DEFAULT_PERIOD_US,
        }
    }
}

/// Pick the spoke width exponent so one spoke spans about one hard tick.
fn spoke_shift_for(period_tc: u64) -> u32 {
    if period_tc <= 1 {
        return 1;
    }
    // Floor log2, rounded up when the period is closer to the next power.
    let floor = 63 - period_tc.leading_zeros();
    if floor >= 62 {
        return floor;
    }
    if period_tc > (3u64 << floor) / 2 { floor + 1 } else { floor }
}

/// Initialize the subsystem: select the time source, compute the unit
/// tables, and wire up one wheel per PCPU.  Idempotent; only the first
/// caller does the work.
pub fn init(config: &TimerConfig) {
    if !INIT_ONCE.init_once() {
        return;
    }

    source::init(config.source, config.cycles_per_second);
    let hz = source::cycles_per_second();
    rate::init_units(hz);
    set_pcpu_count(config.pcpu_count);

    let period_us = if config.interrupt_period_us != 0 {
        config.interrupt_period_us
    } else {
        DEFAULT_PERIOD_US
    };
    DESIRED_PERIOD_US.store(period_us, Ordering::Release);

    let period_tc = rate::us_to_tc(period_us as u64);
    let spoke_shift = spoke_shift_for(period_tc);
    let sched_period_tc = period_tc;
    let stats_period_tc = rate::us_to_tc(STATS_PERIOD_US);
    let jiffy_period_tc = rate::us_to_tc(JIFFY_PERIOD_US);

    let now_tc = source::now();
    for pcpu in 0..pcpu_count() {
        wheel(pcpu).lock().init(
            pcpu,
            now_tc,
            spoke_shift,
            period_us,
            sched_period_tc,
            stats_period_tc,
            jiffy_period_tc,
        );
    }

    MODULE_READY.mark_set();
    klog_info!(
        "TIMER: {} wheels, {} slots / {} spokes each, tick {} us, spoke width 2^{} tc",
        pcpu_count(),
        MAX_TIMERS,
        NUM_SPOKES,
        period_us,
        spoke_shift,
    );
}

/// Whether `init` has completed.
#[inline]
pub fn is_initialized() -> bool {
    MODULE_READY.is_set()
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

const GROUP_PCPU_SHIFT: u32 = 24;
const GROUP_SEQ_MASK: u32 = (1 << GROUP_PCPU_SHIFT) - 1;

/// Tag identifying a set of timers removable together.  High bits carry the
/// owning PCPU, low bits a per-PCPU monotonic counter.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GroupId(u32);

impl GroupId {
    pub const NONE: Self = Self(0);

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn pcpu(self) -> usize {
        (self.0 >> GROUP_PCPU_SHIFT) as usize
    }
}

/// Allocate a group identifier owned by `pcpu`.
pub fn create_group(pcpu: usize) -> GroupId {
    assert!(pcpu < pcpu_count(), "TIMER: create_group for offline PCPU {}", pcpu);
    let seq = wheel(pcpu).lock().alloc_group_seq();
    GroupId(((pcpu as u32) << GROUP_PCPU_SHIFT) | (seq & GROUP_SEQ_MASK))
}

/// Remove every timer tagged with `group` on its owning PCPU.
pub fn remove_group(group: GroupId) {
    if group == GroupId::NONE {
        return;
    }
    let pcpu = group.pcpu();
    if pcpu >= pcpu_count() {
        return;
    }
    let removed = wheel(pcpu).lock().remove_group(group.raw());
    if removed != 0 {
        klog_info!("TIMER: removed {} timers of group {:#x}", removed, group.raw());
    }
}

// ---------------------------------------------------------------------------
// Add
// ---------------------------------------------------------------------------

fn add_checked(
    pcpu: usize,
    group: GroupId,
    cb: TimerCallback,
    data: *mut c_void,
    deadline_tc: u64,
    period_tc: u64,
) -> TimerHandle {
    assert!(is_initialized(), "TIMER: add before module init");
    assert!(pcpu < pcpu_count(), "TIMER: add on offline PCPU {}", pcpu);
    assert!(
        period_tc == 0 || period_tc >= min_period_tc(),
        "TIMER: period {} tc below the {} us floor",
        period_tc,
        TIMER_MIN_PERIOD_US,
    );

    let mut w = wheel(pcpu).lock();
    let Some(slot) = w.alloc_slot() else {
        // Slots are provisioned up-front; running dry is a sizing bug, not
        // a runtime condition.
        panic!("TIMER: PCPU {} wheel out of slots ({})", pcpu, MAX_TIMERS);
    };
    w.arm(slot, cb, data, deadline_tc, period_tc, group.raw())
}

/// Schedule a callback on `pcpu` at absolute `deadline_tc`, re-arming every
/// `period_tc` (0 for one-shot).  Returns the timer's handle.
pub fn add(
    pcpu: usize,
    cb: TimerCallback,
    data: *mut c_void,
    deadline_tc: u64,
    period_tc: u64,
) -> TimerHandle {
    add_checked(pcpu, GroupId::NONE, cb, data, deadline_tc, period_tc)
}

/// [`add`], tagging the timer with a removal group.
pub fn add_group(
    pcpu: usize,
    group: GroupId,
    cb: TimerCallback,
    data: *mut c_void,
    deadline_tc: u64,
    period_tc: u64,
) -> TimerHandle {
    add_checked(pcpu, group, cb, data, deadline_tc, period_tc)
}

/// Schedule on the current PCPU, `timeout_us` from now; periodic at that
/// interval when `periodic`.
pub fn add_hires(timeout_us: u64, periodic: bool, cb: TimerCallback, data: *mut c_void) -> TimerHandle {
    let delta_tc = rate::us_to_tc(timeout_us);
    let deadline_tc = source::now().wrapping_add(delta_tc);
    let period_tc = if periodic { delta_tc } else { 0 };
    add_checked(current_pcpu_id(), GroupId::NONE, cb, data, deadline_tc, period_tc)
}

/// Millisecond-granularity convenience wrapper over [`add_hires`].
pub fn add_ms(timeout_ms: u64, periodic: bool, cb: TimerCallback, data: *mut c_void) -> TimerHandle {
    add_hires(timeout_ms * 1000, periodic, cb, data)
}

// ---------------------------------------------------------------------------
// Remove / modify / inspect
// ---------------------------------------------------------------------------

#[inline]
fn route(handle: TimerHandle) -> Option<usize> {
    if handle == TimerHandle::INVALID {
        return None;
    }
    let pcpu = handle.pcpu();
    if pcpu >= pcpu_count() { None } else { Some(pcpu) }
}

/// Remove a timer.  Returns true iff this call freed the slot.
///
/// If the callback is running on another PCPU right now, the slot is marked
/// for reclamation instead and the firing loop frees it on return — the
/// call then returns false, exactly as it does for a stale handle.  Safe to
/// call from within a callback for the callback's own timer.
pub fn remove(handle: TimerHandle) -> bool {
    let Some(pcpu) = route(handle) else {
        return false;
    };
    let mut w = wheel(pcpu).lock();
    match w.lookup(handle, false) {
        Some(slot) => w.remove_slot(slot),
        None => false,
    }
}

/// Remove a timer, waiting out a callback that is currently running.
///
/// Returns true once the slot is free; false if the handle was already
/// stale.  Must not be called from the handle's own PCPU (the wait would
/// deadlock the firing loop there), which also rules out calling it from
/// the handle's own callback.
pub fn remove_sync(handle: TimerHandle) -> bool {
    let Some(pcpu) = route(handle) else {
        return false;
    };
    assert!(
        pcpu != current_pcpu_id(),
        "TIMER: remove_sync on handle {:#x} from its own PCPU {}",
        handle.raw(),
        pcpu,
    );

    {
        let mut w = wheel(pcpu).lock();
        let Some(slot) = w.lookup(handle, true) else {
            return false;
        };
        if w.remove_slot(slot) {
            return true;
        }
        // FIRING elsewhere: the free is now owed, wait for it below.
    }

    let mut warnings = 0u32;
    loop {
        for _ in 0..SYNC_SPINS_PER_WARNING {
            {
                let w = wheel(pcpu).lock();
                if w.lookup(handle, true).is_none() {
                    return true;
                }
            }
            cpu::pause();
        }
        warnings += 1;
        klog_warn!(
            "TIMER: remove_sync still waiting on FIRING handle {:#x} (warning {}/{})",
            handle.raw(),
            warnings,
            SYNC_MAX_WARNINGS,
        );
        if warnings >= SYNC_MAX_WARNINGS {
            // A callback this stuck means the wheel state can no longer be
            // trusted; stopping is safer than returning.
            panic!("TIMER: remove_sync stuck on handle {:#x}", handle.raw());
        }
    }
}

/// Re-aim a timer at `deadline_tc` (and, for periodic timers, `period_tc`).
///
/// Returns false for a stale handle.  If the timer's callback is running
/// right now the deadline change is lost (the in-flight cycle already chose
/// its deadline); the period change survives to later cycles.
pub fn modify(handle: TimerHandle, deadline_tc: u64, period_tc: u64) -> bool {
    let Some(pcpu) = route(handle) else {
        return false;
    };
    assert!(
        period_tc == 0 || period_tc >= min_period_tc(),
        "TIMER: modify period {} tc below the {} us floor",
        period_tc,
        TIMER_MIN_PERIOD_US,
    );
    let mut w = wheel(pcpu).lock();
    match w.lookup(handle, false) {
        Some(slot) => w.modify_slot(slot, deadline_tc, period_tc),
        None => false,
    }
}

/// Snapshot a timer's deadline and period, or None for a stale handle.
pub fn get_timeout(handle: TimerHandle) -> Option<(u64, u64)> {
    let pcpu = route(handle)?;
    let w = wheel(pcpu).lock();
    let slot = w.lookup(handle, false)?;
    let t = w.timer(slot);
    Some((t.deadline_tc, t.period_tc))
}

/// Whether the handle still names a live timer.
///
/// The answer is not stable — a concurrent firing can flip it to false the
/// moment the lock drops — but it is monotone: once false, never true
/// again.
pub fn pending(handle: TimerHandle) -> bool {
    let Some(pcpu) = route(handle) else {
        return false;
    };
    wheel(pcpu).lock().lookup(handle, false).is_some()
}

// ---------------------------------------------------------------------------
// Process-wide clocks and the period tunable
// ---------------------------------------------------------------------------

/// The 10 ms jiffies counter.
#[inline]
pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

/// Wall-clock time in µs (time-of-day offset + uptime).
pub fn time_of_day_us() -> u64 {
    let uptime = rate::tc_to_us(source::now()) as i64;
    TOD_OFFSET_US.load(Ordering::Relaxed).wrapping_add(uptime) as u64
}

/// Set wall-clock time; the offset absorbs the current uptime.
pub fn set_time_of_day_us(us: u64) {
    let uptime = rate::tc_to_us(source::now()) as i64;
    TOD_OFFSET_US.store((us as i64).wrapping_sub(uptime), Ordering::Relaxed);
}

/// Request a new hard-interrupt period.  Takes effect at the next hard tick
/// on each PCPU, which reprograms its interrupt controller.
pub fn set_interrupt_period_us(us: u32) {
    assert!(us != 0, "TIMER: interrupt period must be nonzero");
    DESIRED_PERIOD_US.store(us, Ordering::Release);
}

/// The currently requested hard-interrupt period.
pub fn interrupt_period_us() -> u32 {
    DESIRED_PERIOD_US.load(Ordering::Acquire)
}
