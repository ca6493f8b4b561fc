//! Hard-interrupt and bottom-half entry points.
//!
//! The interrupt controller calls [`interrupt`] at the configured rate on
//! every PCPU.  Under the wheel lock it refreshes the clock, checks whether
//! any spoke head is due (and if so asks the bottom-half dispatcher to run
//! [`bottom_half`] on this PCPU), drives the scheduler / jiffies / stats
//! deadlines, and reprograms the controller when the period tunable moved.
//!
//! The bottom half runs the firing loop.  [`soft_poll`] is the same loop
//! exposed to every other bottom-half entry: because spokes are sorted, the
//! common nothing-ready call inspects one spoke head and returns, so
//! opportunistic polling is cheap and timers routinely fire well before the
//! next hard tick.

use vexo_lib::kernel_services;
use vexo_lib::pcpu::current_pcpu_id;

use crate::rate;
use crate::source;
use crate::timer::{self, wheel};

/// Hard-interrupt entry point.  Runs under the wheel lock with interrupts
/// already disabled on this PCPU.
pub fn interrupt() {
    if !timer::is_initialized() {
        return;
    }
    let pcpu = current_pcpu_id();
    let mut w = wheel(pcpu).lock();

    w.stats.interrupts += 1;
    w.advance_clock(source::now());
    let now_tc = w.cur_tc;

    if w.any_due() {
        w.stats.bh_wakeups += 1;
        kernel_services::schedule_bottom_half(pcpu);
    }

    if now_tc >= w.sched_deadline_tc {
        w.sched_deadline_tc = w.sched_deadline_tc.wrapping_add(w.sched_period_tc);
        if w.sched_deadline_tc <= now_tc {
            w.sched_deadline_tc = now_tc.wrapping_add(w.sched_period_tc);
        }
        // Contract: the scheduler may not block and may not call back into
        // timer APIs, so delivering under the wheel lock is fine.
        kernel_services::sched_tick(now_tc);
    }

    if pcpu == 0 && now_tc >= w.jiffy_deadline_tc {
        w.jiffy_deadline_tc = w.jiffy_deadline_tc.wrapping_add(w.jiffy_period_tc);
        if w.jiffy_deadline_tc <= now_tc {
            w.jiffy_deadline_tc = now_tc.wrapping_add(w.jiffy_period_tc);
        }
        timer::bump_jiffies();
    }

    if now_tc >= w.stats_deadline_tc {
        w.stats_deadline_tc = w.stats_deadline_tc.wrapping_add(w.stats_period_tc);
        if w.stats_deadline_tc <= now_tc {
            w.stats_deadline_tc = now_tc.wrapping_add(w.stats_period_tc);
        }
        kernel_services::stats_tick(now_tc);
    }

    let desired_us = timer::desired_period_us();
    if desired_us != w.period_us {
        let remaining = kernel_services::set_interrupt_period(rate::us_to_tc(desired_us as u64));
        w.stats.cycles_lost += remaining;
        w.stats.period_sets += 1;
        w.period_us = desired_us;
    }
}

/// Bottom-half entry point: the firing loop for this PCPU.  Runs with
/// interrupts enabled; the wheel lock is taken per timer and released
/// across each callback.
pub fn bottom_half() {
    if !timer::is_initialized() {
        return;
    }
    fire_ready(current_pcpu_id());
}

/// Opportunistic wheel evaluation for any bottom-half entry that is not the
/// timer's own.  Identical to [`bottom_half`]; the name marks intent at the
/// call sites.
#[inline]
pub fn soft_poll() {
    bottom_half();
}

/// Fire every due timer on `pcpu`, in deadline order.
///
/// Each iteration detaches one due timer under the lock, marks it FIRING,
/// releases the lock, invokes the callback with `(data, cur_tc)`, then
/// reacquires the lock to complete the firing.  Releasing the lock lets the
/// callback call back into the subsystem — including removing or modifying
/// the very timer that is firing.
fn fire_ready(pcpu: usize) {
    let lock = wheel(pcpu);
    loop {
        let mut w = lock.lock();
        w.advance_clock(source::now());
        let Some(slot) = w.pop_due() else {
            break;
        };
        let (cb, data, now_tc) = {
            let t = w.timer(slot);
            (t.cb, t.data, w.cur_tc)
        };
        drop(w);

        if let Some(cb) = cb {
            cb(data, now_tc);
        }

        lock.lock().finish_firing(slot);
    }
}
