//! The per-PCPU timing wheel.
//!
//! Each PCPU owns one `TimerWheel`: a fixed slab of timer slots, an array of
//! spoke lists hashed by deadline, and a free list.  Spokes are kept sorted
//! ascending by deadline, so the head of a spoke is the earliest timer in
//! it and the common "nothing ready" poll inspects one head and returns.
//!
//! # Structure
//!
//! Slots link to each other by index (`u16`), never by pointer, so the
//! whole wheel is a single movable value — the locked wrapper in
//! `timer.rs` puts it behind an `IrqMutex`, and tests drive it directly
//! with a synthetic clock.  `spoke(d) = (d >> F) & (S - 1)` with `2^F`
//! tuned to one hard-tick period; overdue deadlines hash to `cur_spoke`
//! instead so they are found on the very next poll.
//!
//! # The FIRING/EXPIRED discipline
//!
//! A firing timer is detached from its spoke and marked `FIRING` before the
//! caller drops the wheel lock to run the callback.  A concurrent remove
//! that sees `FIRING` must not free the slot; it sets `EXPIRED` instead,
//! recording that a free is owed.  When the callback returns,
//! [`TimerWheel::finish_firing`] performs the owed free, or re-inserts the
//! timer if it is periodic and still wanted.  One-shot timers are marked
//! `EXPIRED` on the way out, which makes their handles invalid the moment
//! they detach and guarantees the slot is freed exactly once.

use core::ffi::c_void;

use bitflags::bitflags;

use crate::handle::{TimerHandle, next_generation};

/// Slots per wheel.  Exhaustion is a provisioning error, asserted in the
/// public API; size for worlds-per-PCPU × timers-per-world.
pub const MAX_TIMERS: usize = 512;

/// Spokes per wheel.  Sized near the expected count of outstanding timers
/// so sorted insertion stays O(1) in the expected case.
pub const NUM_SPOKES: usize = 64;

const SPOKE_MASK: u64 = NUM_SPOKES as u64 - 1;

/// Null link in the index-linked lists.
const NIL: u16 = u16::MAX;

/// Callback invoked when a timer fires: `(data, now_tc)`.
pub type TimerCallback = fn(data: *mut c_void, now_tc: u64);

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TimerFlags: u32 {
        /// Fires once, then the slot is reclaimed.
        const ONE_SHOT = 1 << 0;
        /// Re-arms itself every `period_tc`.
        const PERIODIC = 1 << 1;
        /// Slot is on the free list.
        const FREE     = 1 << 2;
        /// Callback is running; slot is on no list.
        const FIRING   = 1 << 3;
        /// A free is owed when the callback returns (or, for one-shots,
        /// the timer has fired and the handle is dead).
        const EXPIRED  = 1 << 4;
    }
}

/// One slot of the slab.
pub(crate) struct Timer {
    pub(crate) cb: Option<TimerCallback>,
    pub(crate) data: *mut c_void,
    pub(crate) flags: TimerFlags,
    pub(crate) deadline_tc: u64,
    pub(crate) period_tc: u64,
    pub(crate) group: u32,
    /// Current handle value; the generation lives in its high bits and is
    /// bumped on every free.
    pub(crate) handle: u64,
    /// Spoke this slot is armed on, or NIL.
    spoke: u16,
    next: u16,
    prev: u16,
}

impl Timer {
    const fn unused() -> Self {
        Self {
            cb: None,
            data: core::ptr::null_mut(),
            flags: TimerFlags::FREE,
            deadline_tc: 0,
            period_tc: 0,
            group: 0,
            handle: 0,
            spoke: NIL,
            next: NIL,
            prev: NIL,
        }
    }
}

/// Per-wheel counters, all monotonic.
#[derive(Clone, Copy, Debug, Default)]
pub struct WheelStats {
    /// Hard interrupts taken on this PCPU.
    pub interrupts: u64,
    /// Times the interrupt period was reprogrammed.
    pub period_sets: u64,
    /// Cycles remaining in periods cut short by reprogramming.
    pub cycles_lost: u64,
    /// Periodic deadlines skipped because the wheel fell behind.
    pub overdue_dropped: u64,
    /// Callbacks dispatched.
    pub fired: u64,
    /// Bottom-half wakeups requested by the hard tick.
    pub bh_wakeups: u64,
}

pub struct TimerWheel {
    pcpu: u32,
    /// Spoke width exponent F: one spoke spans `2^F` time-source units.
    spoke_shift: u32,
    /// Time source at the last observation on this PCPU.
    pub(crate) cur_tc: u64,
    /// Last spoke checked by the firing loop, as an **absolute** spoke
    /// number (`tc >> F`, unmasked).  Keeping it absolute lets the walk
    /// notice when the clock jumped a whole revolution or more, in which
    /// case every spoke must be visited once.
    cur_spoke_abs: u64,
    /// Interrupt period currently programmed into the controller, in µs.
    pub(crate) period_us: u32,
    pub(crate) sched_deadline_tc: u64,
    pub(crate) sched_period_tc: u64,
    pub(crate) stats_deadline_tc: u64,
    pub(crate) stats_period_tc: u64,
    pub(crate) jiffy_deadline_tc: u64,
    pub(crate) jiffy_period_tc: u64,
    next_group_seq: u32,
    free_head: u16,
    free_tail: u16,
    free_count: u32,
    pub(crate) stats: WheelStats,
    spokes: [u16; NUM_SPOKES],
    timers: [Timer; MAX_TIMERS],
}

// SAFETY: the raw `data` pointers stored in slots are opaque cookies the
// wheel never dereferences; all access to the wheel itself is serialized by
// the owning IrqMutex.
unsafe impl Send for TimerWheel {}

impl TimerWheel {
    pub const fn new() -> Self {
        const UNUSED: Timer = Timer::unused();
        Self {
            pcpu: 0,
            spoke_shift: 0,
            cur_tc: 0,
            cur_spoke_abs: 0,
            period_us: 0,
            sched_deadline_tc: 0,
            sched_period_tc: 0,
            stats_deadline_tc: 0,
            stats_period_tc: 0,
            jiffy_deadline_tc: 0,
            jiffy_period_tc: 0,
            next_group_seq: 0,
            free_head: NIL,
            free_tail: NIL,
            free_count: 0,
            stats: WheelStats {
                interrupts: 0,
                period_sets: 0,
                cycles_lost: 0,
                overdue_dropped: 0,
                fired: 0,
                bh_wakeups: 0,
            },
            spokes: [NIL; NUM_SPOKES],
            timers: [UNUSED; MAX_TIMERS],
        }
    }

    /// Wire up the slab for `pcpu`: chain the free list, seed every slot's
    /// handle at generation 1, and position the clock and the periodic
    /// kernel deadlines.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn init(
        &mut self,
        pcpu: usize,
        now_tc: u64,
        spoke_shift: u32,
        period_us: u32,
        sched_period_tc: u64,
        stats_period_tc: u64,
        jiffy_period_tc: u64,
    ) {
        self.pcpu = pcpu as u32;
        self.spoke_shift = spoke_shift;
        self.cur_tc = now_tc;
        self.period_us = period_us;
        self.sched_period_tc = sched_period_tc;
        self.sched_deadline_tc = now_tc.wrapping_add(sched_period_tc);
        self.stats_period_tc = stats_period_tc;
        self.stats_deadline_tc = now_tc.wrapping_add(stats_period_tc);
        self.jiffy_period_tc = jiffy_period_tc;
        self.jiffy_deadline_tc = now_tc.wrapping_add(jiffy_period_tc);
        self.next_group_seq = 0;
        self.stats = WheelStats::default();
        self.spokes = [NIL; NUM_SPOKES];

        for (i, t) in self.timers.iter_mut().enumerate() {
            *t = Timer::unused();
            t.handle = TimerHandle::encode(1, i, pcpu).raw();
            t.next = if i + 1 < MAX_TIMERS { (i + 1) as u16 } else { NIL };
        }
        self.free_head = 0;
        self.free_tail = (MAX_TIMERS - 1) as u16;
        self.free_count = MAX_TIMERS as u32;
        self.cur_spoke_abs = now_tc >> spoke_shift;
    }

    // -----------------------------------------------------------------------
    // Spoke hashing
    // -----------------------------------------------------------------------

    /// Overdue deadlines land in the current spoke so the next poll fires
    /// them.
    #[inline]
    fn spoke_for_deadline(&self, deadline_tc: u64) -> usize {
        let spoke_of = if deadline_tc <= self.cur_tc {
            self.cur_spoke_abs
        } else {
            deadline_tc >> self.spoke_shift
        };
        (spoke_of & SPOKE_MASK) as usize
    }

    /// Clamp the walk start so at most one full revolution is visited: when
    /// the clock jumps further than that, one pass over every spoke already
    /// covers all possible deadlines.
    #[inline]
    fn clamp_walk_start(&mut self) -> u64 {
        let target_abs = self.cur_tc >> self.spoke_shift;
        if self.cur_spoke_abs + (NUM_SPOKES as u64) <= target_abs {
            self.cur_spoke_abs = target_abs - (NUM_SPOKES as u64 - 1);
        }
        target_abs
    }

    /// Fold a new time-source observation in.  `cur_tc` never moves
    /// backwards on a given PCPU; shift corrections keep the source itself
    /// monotonic across TSC resets.
    #[inline]
    pub(crate) fn advance_clock(&mut self, now_tc: u64) {
        if now_tc > self.cur_tc {
            self.cur_tc = now_tc;
        }
    }

    // -----------------------------------------------------------------------
    // Slab and free list
    // -----------------------------------------------------------------------

    pub(crate) fn alloc_slot(&mut self) -> Option<u16> {
        let slot = self.free_head;
        if slot == NIL {
            return None;
        }
        let next = self.timers[slot as usize].next;
        self.free_head = next;
        if next == NIL {
            self.free_tail = NIL;
        }
        self.free_count -= 1;

        let t = &mut self.timers[slot as usize];
        t.next = NIL;
        t.flags = TimerFlags::empty();
        Some(slot)
    }

    /// Return a slot to the rear of the free list and invalidate every
    /// outstanding handle to it by bumping the generation.
    fn release_slot(&mut self, slot: u16) {
        let i = slot as usize;
        let generation =
            next_generation(TimerHandle::from_raw(self.timers[i].handle).generation());
        let handle = TimerHandle::encode(generation, i, self.pcpu as usize).raw();

        self.timers[i] = Timer::unused();
        self.timers[i].handle = handle;

        if self.free_tail == NIL {
            self.free_head = slot;
        } else {
            self.timers[self.free_tail as usize].next = slot;
        }
        self.free_tail = slot;
        self.free_count += 1;
    }

    #[inline]
    pub(crate) fn free_count(&self) -> u32 {
        self.free_count
    }

    // -----------------------------------------------------------------------
    // Spoke lists
    // -----------------------------------------------------------------------

    /// Sorted insertion by deadline; equal deadlines keep insertion order,
    /// which gives FIFO firing among ties.
    fn insert_into_spoke(&mut self, slot: u16) {
        let deadline = self.timers[slot as usize].deadline_tc;
        let s = self.spoke_for_deadline(deadline);

        let mut prev = NIL;
        let mut cur = self.spokes[s];
        while cur != NIL && self.timers[cur as usize].deadline_tc <= deadline {
            prev = cur;
            cur = self.timers[cur as usize].next;
        }

        {
            let t = &mut self.timers[slot as usize];
            t.spoke = s as u16;
            t.next = cur;
            t.prev = prev;
        }
        if prev == NIL {
            self.spokes[s] = slot;
        } else {
            self.timers[prev as usize].next = slot;
        }
        if cur != NIL {
            self.timers[cur as usize].prev = slot;
        }
    }

    fn detach_from_spoke(&mut self, slot: u16) {
        let (s, next, prev) = {
            let t = &self.timers[slot as usize];
            (t.spoke, t.next, t.prev)
        };
        debug_assert!(s != NIL);

        if prev == NIL {
            self.spokes[s as usize] = next;
        } else {
            self.timers[prev as usize].next = next;
        }
        if next != NIL {
            self.timers[next as usize].prev = prev;
        }

        let t = &mut self.timers[slot as usize];
        t.spoke = NIL;
        t.next = NIL;
        t.prev = NIL;
    }

    // -----------------------------------------------------------------------
    // Arming and lookup
    // -----------------------------------------------------------------------

    /// Populate a freshly allocated slot and hang it on its spoke.
    /// Returns the slot's handle.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn arm(
        &mut self,
        slot: u16,
        cb: TimerCallback,
        data: *mut c_void,
        deadline_tc: u64,
        period_tc: u64,
        group: u32,
    ) -> TimerHandle {
        let handle = {
            let t = &mut self.timers[slot as usize];
            t.cb = Some(cb);
            t.data = data;
            t.deadline_tc = deadline_tc;
            t.period_tc = period_tc;
            t.group = group;
            t.flags = if period_tc != 0 {
                TimerFlags::PERIODIC
            } else {
                TimerFlags::ONE_SHOT
            };
            TimerHandle::from_raw(t.handle)
        };
        self.insert_into_spoke(slot);
        handle
    }

    /// Resolve a handle to its slot, or None if stale.
    ///
    /// `allow_expired` is for the synchronous-remove path, which must still
    /// see a timer whose callback is in flight and whose free is already
    /// owed.
    pub(crate) fn lookup(&self, handle: TimerHandle, allow_expired: bool) -> Option<u16> {
        let slot = handle.slot();
        if slot >= MAX_TIMERS {
            return None;
        }
        let t = &self.timers[slot];
        if t.handle != handle.raw() || t.flags.contains(TimerFlags::FREE) {
            return None;
        }
        if !allow_expired && t.flags.contains(TimerFlags::EXPIRED) {
            return None;
        }
        Some(slot as u16)
    }

    #[inline]
    pub(crate) fn timer(&self, slot: u16) -> &Timer {
        &self.timers[slot as usize]
    }

    pub(crate) fn timers(&self) -> &[Timer] {
        &self.timers
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    /// Whether any armed timer between the last checked spoke and the
    /// current one is due.  Does not advance the walk position; the firing
    /// loop owns that.
    pub(crate) fn any_due(&self) -> bool {
        let target_abs = self.cur_tc >> self.spoke_shift;
        let mut abs = self.cur_spoke_abs;
        if abs + (NUM_SPOKES as u64) <= target_abs {
            abs = target_abs - (NUM_SPOKES as u64 - 1);
        }
        loop {
            let head = self.spokes[(abs & SPOKE_MASK) as usize];
            if head != NIL && self.timers[head as usize].deadline_tc <= self.cur_tc {
                return true;
            }
            if abs >= target_abs {
                return false;
            }
            abs += 1;
        }
    }

    /// Detach the next due timer, transition it to FIRING, and return its
    /// slot; None when nothing between `cur_spoke` and the current spoke is
    /// due.  Advances `cur_spoke` past drained spokes.
    ///
    /// A periodic timer gets its next deadline here, before the callback
    /// runs.  If that deadline is already past, the missed cycles are
    /// dropped and the timer re-aims at `cur_tc + period`: a callback that
    /// cannot keep up is rate-limited, not burst-fired to catch up.
    pub(crate) fn pop_due(&mut self) -> Option<u16> {
        let target_abs = self.clamp_walk_start();
        loop {
            let head = self.spokes[(self.cur_spoke_abs & SPOKE_MASK) as usize];
            if head != NIL && self.timers[head as usize].deadline_tc <= self.cur_tc {
                self.detach_from_spoke(head);
                let cur_tc = self.cur_tc;
                let t = &mut self.timers[head as usize];
                if t.flags.contains(TimerFlags::PERIODIC) {
                    t.deadline_tc = t.deadline_tc.wrapping_add(t.period_tc);
                    if t.deadline_tc <= cur_tc {
                        t.deadline_tc = cur_tc.wrapping_add(t.period_tc);
                        self.stats.overdue_dropped += 1;
                    }
                } else {
                    t.flags.insert(TimerFlags::EXPIRED);
                }
                self.timers[head as usize].flags.insert(TimerFlags::FIRING);
                self.stats.fired += 1;
                return Some(head);
            }
            if self.cur_spoke_abs >= target_abs {
                return None;
            }
            self.cur_spoke_abs += 1;
        }
    }

    /// Complete a firing begun by [`pop_due`](Self::pop_due), after the
    /// callback has returned and the lock is held again.  Frees the slot if
    /// a free is owed (one-shot completion or a concurrent remove during the
    /// callback), otherwise re-arms the periodic timer.
    pub(crate) fn finish_firing(&mut self, slot: u16) {
        let flags = {
            let t = &mut self.timers[slot as usize];
            debug_assert!(t.flags.contains(TimerFlags::FIRING));
            t.flags.remove(TimerFlags::FIRING);
            t.flags
        };
        if flags.contains(TimerFlags::EXPIRED) {
            self.release_slot(slot);
        } else {
            // Only a periodic timer survives its callback un-expired.
            self.insert_into_spoke(slot);
        }
    }

    // -----------------------------------------------------------------------
    // Removal and modification
    // -----------------------------------------------------------------------

    /// Remove discipline shared by remove, remove-group, and the first pass
    /// of remove-sync.  Returns true iff this call freed the slot; a FIRING
    /// timer is only marked EXPIRED, deferring the free to
    /// [`finish_firing`](Self::finish_firing).
    pub(crate) fn remove_slot(&mut self, slot: u16) -> bool {
        let t = &mut self.timers[slot as usize];
        if t.flags.contains(TimerFlags::FIRING) {
            t.flags.insert(TimerFlags::EXPIRED);
            return false;
        }
        self.detach_from_spoke(slot);
        self.release_slot(slot);
        true
    }

    /// Move a timer to a new deadline (and period, if periodic).
    ///
    /// On a FIRING timer the list surgery is skipped: the firing loop
    /// already owns the re-insert.  The period update is applied so later
    /// cycles see it; the deadline update is lost, and callers are told not
    /// to rely on in-flight modification.
    pub(crate) fn modify_slot(&mut self, slot: u16, deadline_tc: u64, period_tc: u64) -> bool {
        let firing = {
            let t = &mut self.timers[slot as usize];
            if t.flags.contains(TimerFlags::PERIODIC) {
                t.period_tc = period_tc;
            }
            t.flags.contains(TimerFlags::FIRING)
        };
        if firing {
            return true;
        }
        self.detach_from_spoke(slot);
        self.timers[slot as usize].deadline_tc = deadline_tc;
        self.insert_into_spoke(slot);
        true
    }

    /// Detach and free every timer tagged `group`.  Armed timers free
    /// immediately; FIRING ones are marked EXPIRED like any other remove.
    /// Returns how many timers this call affected.
    pub(crate) fn remove_group(&mut self, group: u32) -> usize {
        let mut removed = 0;
        for s in 0..NUM_SPOKES {
            let mut cur = self.spokes[s];
            while cur != NIL {
                let next = self.timers[cur as usize].next;
                if self.timers[cur as usize].group == group {
                    self.detach_from_spoke(cur);
                    self.release_slot(cur);
                    removed += 1;
                }
                cur = next;
            }
        }
        // Firing timers are on no spoke; sweep the slab for them.
        for i in 0..MAX_TIMERS {
            let t = &mut self.timers[i];
            if t.group == group && t.flags.contains(TimerFlags::FIRING) {
                t.flags.insert(TimerFlags::EXPIRED);
                removed += 1;
            }
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// Next value of this wheel's monotonic group counter (starts at 1).
    pub(crate) fn alloc_group_seq(&mut self) -> u32 {
        self.next_group_seq = self.next_group_seq.wrapping_add(1);
        if self.next_group_seq == 0 {
            self.next_group_seq = 1;
        }
        self.next_group_seq
    }

    // -----------------------------------------------------------------------
    // Introspection for the status surface
    // -----------------------------------------------------------------------

    #[inline]
    pub(crate) fn cur_spoke(&self) -> usize {
        (self.cur_spoke_abs & SPOKE_MASK) as usize
    }

    /// Invariant check used by the test suites: every spoke sorted
    /// non-decreasing by deadline, and the free list disjoint from spokes.
    #[cfg(any(test, feature = "itests"))]
    #[allow(dead_code)]
    pub(crate) fn check_invariants(&self) -> bool {
        for s in 0..NUM_SPOKES {
            let mut cur = self.spokes[s];
            let mut last = 0u64;
            while cur != NIL {
                let t = &self.timers[cur as usize];
                if t.flags.contains(TimerFlags::FREE) || t.deadline_tc < last {
                    return false;
                }
                last = t.deadline_tc;
                cur = t.next;
            }
        }
        let mut cur = self.free_head;
        let mut count = 0u32;
        while cur != NIL {
            let t = &self.timers[cur as usize];
            if !t.flags.contains(TimerFlags::FREE) || t.spoke != NIL {
                return false;
            }
            count += 1;
            cur = t.next;
        }
        count == self.free_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPOKE_SHIFT: u32 = 10; // 1024 tc per spoke
    const T0: u64 = 1 << 20;

    fn nop(_data: *mut c_void, _now_tc: u64) {}

    fn make_wheel() -> TimerWheel {
        let mut w = TimerWheel::new();
        w.init(3, T0, SPOKE_SHIFT, 1000, 1 << 20, 1 << 30, 1 << 24);
        w
    }

    fn arm_new(w: &mut TimerWheel, deadline_tc: u64, period_tc: u64) -> (u16, TimerHandle) {
        let slot = w.alloc_slot().unwrap();
        let h = w.arm(slot, nop, core::ptr::null_mut(), deadline_tc, period_tc, 0);
        (slot, h)
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut w = make_wheel();
        // Staggered deadlines, armed out of order, some sharing a spoke.
        let deadlines = [T0 + 5000, T0 + 100, T0 + 60_000, T0 + 130, T0 + 5001];
        for &d in &deadlines {
            arm_new(&mut w, d, 0);
        }
        assert!(w.check_invariants());

        w.advance_clock(T0 + 65_000);
        let mut fired = [0u64; 5];
        let mut n = 0;
        while let Some(slot) = w.pop_due() {
            fired[n] = w.timer(slot).deadline_tc;
            n += 1;
            w.finish_firing(slot);
        }
        assert_eq!(n, 5);
        let mut sorted = deadlines;
        sorted.sort_unstable();
        assert_eq!(fired, sorted);
        assert_eq!(w.free_count(), MAX_TIMERS as u32);
        assert!(w.check_invariants());
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut w = make_wheel();
        let d = T0 + 4096;
        let (s1, _) = arm_new(&mut w, d, 0);
        let (s2, _) = arm_new(&mut w, d, 0);
        let (s3, _) = arm_new(&mut w, d, 0);

        w.advance_clock(d);
        assert_eq!(w.pop_due(), Some(s1));
        w.finish_firing(s1);
        assert_eq!(w.pop_due(), Some(s2));
        w.finish_firing(s2);
        assert_eq!(w.pop_due(), Some(s3));
        w.finish_firing(s3);
        assert_eq!(w.pop_due(), None);
    }

    #[test]
    fn overdue_arm_fires_on_next_poll() {
        let mut w = make_wheel();
        // Deadline already in the past hashes to cur_spoke.
        let (slot, _) = arm_new(&mut w, T0 - 500, 0);
        assert!(w.any_due());
        assert_eq!(w.pop_due(), Some(slot));
        w.finish_firing(slot);
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut w = make_wheel();
        arm_new(&mut w, T0 + 10_000, 0);
        assert!(!w.any_due());
        assert_eq!(w.pop_due(), None);
        w.advance_clock(T0 + 9_999);
        assert_eq!(w.pop_due(), None);
        w.advance_clock(T0 + 10_000);
        assert!(w.any_due());
        assert!(w.pop_due().is_some());
    }

    #[test]
    fn far_future_timer_survives_a_full_revolution() {
        let mut w = make_wheel();
        let revolution = (NUM_SPOKES as u64) << SPOKE_SHIFT;
        let deadline = T0 + revolution + (5 << SPOKE_SHIFT);
        arm_new(&mut w, deadline, 0);

        // Sweep the whole wheel once while the deadline is still ahead.
        w.advance_clock(T0 + revolution - 1);
        assert_eq!(w.pop_due(), None);

        w.advance_clock(deadline);
        assert!(w.pop_due().is_some());
    }

    #[test]
    fn one_shot_handle_dies_at_fire() {
        let mut w = make_wheel();
        let (slot, h) = arm_new(&mut w, T0 + 1000, 0);
        assert_eq!(w.lookup(h, false), Some(slot));

        w.advance_clock(T0 + 1000);
        let popped = w.pop_due().unwrap();
        assert_eq!(popped, slot);
        // EXPIRED on detach: the handle is already dead mid-callback.
        assert_eq!(w.lookup(h, false), None);
        assert_eq!(w.lookup(h, true), Some(slot));

        w.finish_firing(slot);
        assert_eq!(w.lookup(h, true), None);
        assert_eq!(w.free_count(), MAX_TIMERS as u32);
        // Validity is monotone: the handle never comes back.
        let (slot2, h2) = arm_new(&mut w, T0 + 2000, 0);
        assert_eq!(slot2 == slot, false); // freed to the rear, not reused next
        assert_ne!(h2, h);
        assert_eq!(w.lookup(h, false), None);
    }

    #[test]
    fn generation_bump_never_yields_handle_zero() {
        let mut w = make_wheel();
        let mut seen = [0u64; 8];
        for i in 0..8 {
            let (slot, h) = arm_new(&mut w, T0 + 1000, 0);
            assert_ne!(h.raw(), 0);
            for &prior in &seen[..i] {
                assert_ne!(h.raw(), prior);
            }
            seen[i] = h.raw();
            w.remove_slot(slot);
        }
    }

    #[test]
    fn periodic_readvances_by_period() {
        let mut w = make_wheel();
        let period = 2048u64;
        let (slot, h) = arm_new(&mut w, T0 + period, period);

        w.advance_clock(T0 + period);
        assert_eq!(w.pop_due(), Some(slot));
        assert_eq!(w.timer(slot).deadline_tc, T0 + 2 * period);
        w.finish_firing(slot);
        // Still armed and still valid.
        assert_eq!(w.lookup(h, false), Some(slot));
        assert_eq!(w.stats.overdue_dropped, 0);

        w.advance_clock(T0 + 2 * period);
        assert_eq!(w.pop_due(), Some(slot));
        w.finish_firing(slot);
        assert_eq!(w.stats.fired, 2);
    }

    #[test]
    fn periodic_drops_missed_cycles_instead_of_bursting() {
        let mut w = make_wheel();
        let period = 1024u64;
        let (slot, _) = arm_new(&mut w, T0 + period, period);

        // Fall five periods behind.
        let late = T0 + 6 * period;
        w.advance_clock(late);
        assert_eq!(w.pop_due(), Some(slot));
        // Re-aimed at cur + period, not burst through the missed cycles.
        assert_eq!(w.timer(slot).deadline_tc, late + period);
        assert_eq!(w.stats.overdue_dropped, 1);
        w.finish_firing(slot);

        // Exactly one more firing is due after one more period.
        assert_eq!(w.pop_due(), None);
        w.advance_clock(late + period);
        assert_eq!(w.pop_due(), Some(slot));
        w.finish_firing(slot);
    }

    #[test]
    fn remove_while_firing_defers_the_free() {
        let mut w = make_wheel();
        let period = 4096u64;
        let (slot, h) = arm_new(&mut w, T0 + period, period);

        w.advance_clock(T0 + period);
        assert_eq!(w.pop_due(), Some(slot));

        // Concurrent remove during the callback window: no free yet.
        let free_before = w.free_count();
        assert!(!w.remove_slot(slot));
        assert_eq!(w.free_count(), free_before);
        assert!(w.timer(slot).flags.contains(TimerFlags::EXPIRED));

        // The firing loop performs the owed free exactly once.
        w.finish_firing(slot);
        assert_eq!(w.free_count(), MAX_TIMERS as u32);
        assert_eq!(w.lookup(h, true), None);
        assert!(w.check_invariants());
    }

    #[test]
    fn remove_armed_frees_immediately() {
        let mut w = make_wheel();
        let (slot, h) = arm_new(&mut w, T0 + 3000, 0);
        assert!(w.remove_slot(slot));
        assert_eq!(w.lookup(h, true), None);
        assert_eq!(w.free_count(), MAX_TIMERS as u32);
        w.advance_clock(T0 + 100_000);
        assert_eq!(w.pop_due(), None);
    }

    #[test]
    fn modify_rehashes_to_new_spoke() {
        let mut w = make_wheel();
        let (slot, _) = arm_new(&mut w, T0 + 2000, 0);
        let (other, _) = arm_new(&mut w, T0 + 30_000, 0);

        // Push the first timer past the second.
        assert!(w.modify_slot(slot, T0 + 60_000, 0));
        assert!(w.check_invariants());

        w.advance_clock(T0 + 65_000);
        assert_eq!(w.pop_due(), Some(other));
        w.finish_firing(other);
        assert_eq!(w.pop_due(), Some(slot));
        w.finish_firing(slot);
    }

    #[test]
    fn modify_while_firing_updates_period_only() {
        let mut w = make_wheel();
        let period = 2048u64;
        let (slot, _) = arm_new(&mut w, T0 + period, period);

        w.advance_clock(T0 + period);
        assert_eq!(w.pop_due(), Some(slot));
        let advanced = w.timer(slot).deadline_tc;

        // Mid-callback modify: the period sticks, the deadline does not.
        let new_period = 5 * period;
        assert!(w.modify_slot(slot, T0 + 999_999, new_period));
        assert_eq!(w.timer(slot).period_tc, new_period);
        assert_eq!(w.timer(slot).deadline_tc, advanced);

        w.finish_firing(slot);
        // Next cycle uses the in-flight deadline, later ones the new period.
        w.advance_clock(advanced);
        assert_eq!(w.pop_due(), Some(slot));
        assert_eq!(w.timer(slot).deadline_tc, advanced + new_period);
        w.finish_firing(slot);
    }

    #[test]
    fn group_removal_only_touches_the_group() {
        let mut w = make_wheel();
        let group = 7u32;
        let s_a = w.alloc_slot().unwrap();
        w.arm(s_a, nop, core::ptr::null_mut(), T0 + 1000, 0, group);
        let s_b = w.alloc_slot().unwrap();
        let h_b = w.arm(s_b, nop, core::ptr::null_mut(), T0 + 2000, 0, 0);
        let s_c = w.alloc_slot().unwrap();
        w.arm(s_c, nop, core::ptr::null_mut(), T0 + 3000, 0, group);

        assert_eq!(w.remove_group(group), 2);
        assert_eq!(w.lookup(h_b, false), Some(s_b));
        assert_eq!(w.free_count(), MAX_TIMERS as u32 - 1);
        assert!(w.check_invariants());
    }

    #[test]
    fn group_removal_defers_firing_members() {
        let mut w = make_wheel();
        let group = 9u32;
        let slot = w.alloc_slot().unwrap();
        w.arm(slot, nop, core::ptr::null_mut(), T0 + 1024, 4096, group);

        w.advance_clock(T0 + 1024);
        assert_eq!(w.pop_due(), Some(slot));
        assert_eq!(w.remove_group(group), 1);
        assert!(w.timer(slot).flags.contains(TimerFlags::EXPIRED));

        w.finish_firing(slot);
        assert_eq!(w.free_count(), MAX_TIMERS as u32);
    }

    #[test]
    fn slab_exhaustion_returns_none() {
        let mut w = make_wheel();
        for _ in 0..MAX_TIMERS {
            let slot = w.alloc_slot().unwrap();
            w.arm(slot, nop, core::ptr::null_mut(), T0 + 10_000, 0, 0);
        }
        assert!(w.alloc_slot().is_none());
    }

    #[test]
    fn freed_slots_recycle_through_the_rear() {
        let mut w = make_wheel();
        let (first, _) = arm_new(&mut w, T0 + 1000, 0);
        w.remove_slot(first);
        // The freed slot went to the rear; the next alloc must not be it.
        let (second, _) = arm_new(&mut w, T0 + 1000, 0);
        assert_ne!(first, second);
    }
}
