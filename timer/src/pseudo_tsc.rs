//! Pseudo-TSC: a monotonic cycle counter that looks the same from every
//! PCPU.
//!
//! Guest worlds read a virtualized TSC.  On well-behaved hardware that can
//! be the real TSC, but on NUMA machines the per-package counters run at
//! visibly different rates and drift apart.  Each PCPU therefore carries a
//! conversion from its local TSC to a global "pseudo-TSC" running at
//! PCPU 0's apparent rate: `pseudo = add + (tsc · mult) >> shift`.
//!
//! The rate part (`mult`, `shift`) is fixed at init from the reconciled
//! per-PCPU frequencies; only the offset (`add`) is ever rewritten, by a
//! periodic resynchronization timer on each non-zero NUMA node that pins
//! the local reading to the pseudo-TSC value derived from the time source.
//! Worlds snapshot the current parameters on context switch via
//! [`world_params`] and pick up offset corrections on the next switch or
//! resync tick.
//!
//! Frequency reconciliation at init follows the hardware's constraints:
//! within a node every CPU shares the bus crystal, so reported bus speeds
//! must agree and the CPU multiplier must be of the form n/2; across nodes
//! the bus crystals are nominally identical, so disagreement beyond ~1.6%
//! is reported as a hardware problem.

use core::ffi::c_void;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use spin::Once;

use vexo_lib::pcpu::{CacheAligned, MAX_PCPUS, current_pcpu_id, pcpu_count};
use vexo_lib::{InitFlag, klog_info, klog_warn, tsc};

use crate::rate::{self, RateConv};
use crate::{source, timer};

/// Offset resynchronization interval per node.
const RESYNC_PERIOD_US: u64 = 1_000_000;

/// Cross-node bus-speed agreement bound, in tenths of a percent.
const CROSS_NODE_BUS_TOLERANCE_PERMILLE: u64 = 16;

/// Per-PCPU conversion, readable without a lock: `mult`/`shift` are
/// constant after init, `add` is a single atomic the resync tick rewrites.
struct PcpuClock {
    mult: AtomicU64,
    shift: AtomicU32,
    add: AtomicI64,
}

impl PcpuClock {
    const fn identity() -> Self {
        Self {
            mult: AtomicU64::new(1),
            shift: AtomicU32::new(0),
            add: AtomicI64::new(0),
        }
    }

    fn load(&self) -> RateConv {
        RateConv {
            add: self.add.load(Ordering::Acquire),
            mult: self.mult.load(Ordering::Relaxed),
            shift: self.shift.load(Ordering::Relaxed),
        }
    }

    fn store_rate(&self, conv: RateConv) {
        self.mult.store(conv.mult, Ordering::Relaxed);
        self.shift.store(conv.shift, Ordering::Relaxed);
        self.add.store(conv.add, Ordering::Release);
    }
}

static CLOCKS: [CacheAligned<PcpuClock>; MAX_PCPUS] =
    [const { CacheAligned(PcpuClock::identity()) }; MAX_PCPUS];

static NODE_OF: [AtomicU32; MAX_PCPUS] = [const { AtomicU32::new(0) }; MAX_PCPUS];
static BUS_HZ: [AtomicU64; MAX_PCPUS] = [const { AtomicU64::new(0) }; MAX_PCPUS];

/// Time source → pseudo-TSC (PCPU 0 cycles); identity when the time source
/// is PCPU 0's own TSC.
static TS_TO_PSEUDO: Once<RateConv> = Once::new();

static READY: InitFlag = InitFlag::new();

/// Record a PCPU's measured NUMA node, bus speed, and TSC rate.  Called by
/// bring-up for every PCPU before [`init`].
pub fn describe_pcpu(pcpu: usize, node: u32, bus_hz: u64, tsc_hz: u64) {
    if pcpu >= MAX_PCPUS {
        return;
    }
    NODE_OF[pcpu].store(node, Ordering::Relaxed);
    BUS_HZ[pcpu].store(bus_hz, Ordering::Relaxed);
    source::set_pcpu_hz(pcpu, tsc_hz);
}

/// Reconcile frequencies and set up the per-PCPU conversions.  Runs on the
/// BSP after `timer::init`; each AP then calls [`init_pcpu`] to pin its own
/// offset.  Schedules the per-node resync timers.
pub fn init() {
    if !READY.init_once() {
        return;
    }

    reconcile_frequencies();

    let hz0 = source::pcpu_hz(0);
    TS_TO_PSEUDO.call_once(|| RateConv::compute(0, source::cycles_per_second(), 0, hz0));

    for pcpu in 0..pcpu_count() {
        let conv = RateConv::compute(0, source::pcpu_hz(pcpu), 0, hz0);
        CLOCKS[pcpu].0.store_rate(conv);
    }

    // The BSP can pin its own offset immediately.
    resync_offset(0);

    // One resync timer per non-zero node, owned by the node's first PCPU.
    let mut scheduled = 0u32;
    for node in nonzero_nodes() {
        let owner = first_pcpu_of(node);
        let period_tc = rate::us_to_tc(RESYNC_PERIOD_US);
        timer::add(
            owner,
            resync_node_cb,
            node as usize as *mut c_void,
            source::now().wrapping_add(period_tc),
            period_tc,
        );
        scheduled += 1;
    }

    klog_info!(
        "PSEUDOTSC: reconciled {} PCPUs, {} node resync timers",
        pcpu_count(),
        scheduled,
    );
}

/// Pin this PCPU's offset so its pseudo-TSC agrees with the global value
/// right now.  Called once per AP during its bring-up.
pub fn init_pcpu() {
    resync_offset(current_pcpu_id());
}

/// The pseudo-TSC as seen from the current PCPU.
#[inline]
pub fn pseudo_tsc() -> u64 {
    CLOCKS[current_pcpu_id()].0.load().apply(tsc::rdtsc())
}

/// Snapshot of a PCPU's conversion parameters, for world contexts that
/// export a pseudo-TSC to guest code.  Fetched on context switch; offset
/// corrections land on the next fetch.
pub fn world_params(pcpu: usize) -> RateConv {
    CLOCKS[pcpu % MAX_PCPUS].0.load()
}

// ---------------------------------------------------------------------------
// Offset resynchronization
// ---------------------------------------------------------------------------

/// Pseudo-TSC "truth" at this instant, derived from the time source.
#[inline]
fn pseudo_target() -> u64 {
    TS_TO_PSEUDO
        .get()
        .map(|conv| conv.apply(source::now()))
        .unwrap_or(0)
}

/// Rewrite `add` so `pseudo = target` at the current instant.  The rate
/// fields are untouched.
fn resync_offset(pcpu: usize) {
    let clock = &CLOCKS[pcpu % MAX_PCPUS].0;
    let mult = clock.mult.load(Ordering::Relaxed);
    let shift = clock.shift.load(Ordering::Relaxed);
    let scaled = ((tsc::rdtsc() as u128 * mult as u128) >> shift) as u64;
    let add = (pseudo_target() as i64).wrapping_sub(scaled as i64);
    clock.add.store(add, Ordering::Release);
}

/// Periodic callback on each non-zero node: re-pin the offsets of every
/// PCPU in the node.  CPUs within a node share the bus crystal, so the
/// local TSC reading stands in for all of them.
fn resync_node_cb(data: *mut c_void, _now_tc: u64) {
    let node = data as usize as u32;
    for pcpu in 0..pcpu_count() {
        if NODE_OF[pcpu].load(Ordering::Relaxed) == node {
            resync_offset(pcpu);
        }
    }
}

// ---------------------------------------------------------------------------
// Frequency reconciliation
// ---------------------------------------------------------------------------

fn nodes_in_use() -> impl Iterator<Item = u32> {
    // Small PCPU counts; a quadratic distinct-scan keeps this allocation
    // free.
    (0..pcpu_count()).filter_map(|p| {
        let node = NODE_OF[p].load(Ordering::Relaxed);
        let first = (0..p).all(|q| NODE_OF[q].load(Ordering::Relaxed) != node);
        if first { Some(node) } else { None }
    })
}

fn nonzero_nodes() -> impl Iterator<Item = u32> {
    nodes_in_use().filter(|&n| n != 0)
}

fn first_pcpu_of(node: u32) -> usize {
    (0..pcpu_count())
        .find(|&p| NODE_OF[p].load(Ordering::Relaxed) == node)
        .unwrap_or(0)
}

/// Nudge measured frequencies toward what the hardware can actually be
/// doing: one bus speed per node, CPU multipliers of the form n/2, and
/// cross-node bus agreement within tolerance.
fn reconcile_frequencies() {
    for node in nodes_in_use() {
        let rep = first_pcpu_of(node);
        let node_bus = BUS_HZ[rep].load(Ordering::Relaxed);
        if node_bus == 0 {
            continue;
        }

        for pcpu in 0..pcpu_count() {
            if NODE_OF[pcpu].load(Ordering::Relaxed) != node {
                continue;
            }
            let bus = BUS_HZ[pcpu].load(Ordering::Relaxed);
            if bus != node_bus {
                klog_warn!(
                    "PSEUDOTSC: PCPU {} bus {} Hz disagrees with node {} bus {} Hz",
                    pcpu,
                    bus,
                    node,
                    node_bus,
                );
                BUS_HZ[pcpu].store(node_bus, Ordering::Relaxed);
            }

            // Snap the CPU rate to bus × n/2.
            let measured = source::pcpu_hz(pcpu);
            let half_steps = (2 * measured + node_bus / 2) / node_bus;
            let snapped = node_bus * half_steps / 2;
            if snapped != 0 && snapped != measured {
                klog_info!(
                    "PSEUDOTSC: PCPU {} rate {} Hz snapped to {} Hz ({}*bus/2)",
                    pcpu,
                    measured,
                    snapped,
                    half_steps,
                );
                source::set_pcpu_hz(pcpu, snapped);
            }
        }
    }

    // Cross-node check against node 0's bus.
    let bus0 = BUS_HZ[first_pcpu_of(0)].load(Ordering::Relaxed);
    if bus0 == 0 {
        return;
    }
    for node in nonzero_nodes() {
        let bus = BUS_HZ[first_pcpu_of(node)].load(Ordering::Relaxed);
        let diff = bus.abs_diff(bus0);
        if diff * 1000 > bus0 * CROSS_NODE_BUS_TOLERANCE_PERMILLE {
            klog_warn!(
                "PSEUDOTSC: node {} bus {} Hz diverges from node 0 bus {} Hz beyond {}.{}%",
                node,
                bus,
                bus0,
                CROSS_NODE_BUS_TOLERANCE_PERMILLE / 10,
                CROSS_NODE_BUS_TOLERANCE_PERMILLE % 10,
            );
        }
    }
}
