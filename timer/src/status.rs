//! Diagnostic surfaces: per-PCPU wheel status and uptime.
//!
//! The status-file collaborator renders these into its read-only files;
//! [`dump_state`] logs the same picture through klog for bring-up and
//! post-mortem use.

use core::fmt::{self, Write};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use vexo_lib::klog_info;
use vexo_lib::pcpu::pcpu_count;

use crate::timer::{self, wheel};
use crate::wheel::{TimerCallback, TimerFlags};
use crate::{rate, source};

/// The callback that delivers timer interrupts into guest worlds, if the
/// world subsystem registered it.  Timers carrying it are annotated with
/// their world identifier (the callback's data cookie) in the status
/// output.
static GUEST_TIMER_CB: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

pub fn register_guest_timer_callback(cb: TimerCallback) {
    GUEST_TIMER_CB.store(cb as *mut (), Ordering::Release);
}

fn is_guest_timer_cb(cb: Option<TimerCallback>) -> bool {
    let registered = GUEST_TIMER_CB.load(Ordering::Acquire);
    match cb {
        Some(f) => !registered.is_null() && f as usize == registered as usize,
        None => false,
    }
}

/// Render the per-PCPU state and every live timer into `out`.
pub fn write_status<W: Write>(out: &mut W) -> fmt::Result {
    writeln!(
        out,
        "timer: {} Hz, period {} us, jiffies {}",
        source::cycles_per_second(),
        timer::interrupt_period_us(),
        timer::jiffies(),
    )?;

    for pcpu in 0..pcpu_count() {
        let w = wheel(pcpu).lock();
        writeln!(
            out,
            "pcpu {:3}: hz {} curTC {} spoke {:2} period {} us free {} schedTC {}",
            pcpu,
            source::pcpu_hz(pcpu),
            w.cur_tc,
            w.cur_spoke(),
            w.period_us,
            w.free_count(),
            w.sched_deadline_tc,
        )?;
        writeln!(
            out,
            "          intr {} periodSets {} cyclesLost {} overdueDropped {} fired {} bhWakeups {}",
            w.stats.interrupts,
            w.stats.period_sets,
            w.stats.cycles_lost,
            w.stats.overdue_dropped,
            w.stats.fired,
            w.stats.bh_wakeups,
        )?;

        for t in w.timers() {
            if t.flags.contains(TimerFlags::FREE) {
                continue;
            }
            let kind = if t.flags.contains(TimerFlags::PERIODIC) {
                "periodic"
            } else {
                "one-shot"
            };
            write!(
                out,
                "  timer {:#018x}: deadline {} tc period {} tc ({} us) fn {:#x} data {:#x} {}",
                t.handle,
                t.deadline_tc,
                t.period_tc,
                rate::tc_to_us(t.period_tc),
                t.cb.map(|f| f as usize).unwrap_or(0),
                t.data as usize,
                kind,
            )?;
            if is_guest_timer_cb(t.cb) {
                write!(out, " world {}", t.data as usize)?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Render uptime as `seconds.milliseconds`.
pub fn write_uptime<W: Write>(out: &mut W) -> fmt::Result {
    let ms = rate::tc_to_ms(source::now());
    write!(out, "{}.{:03}", ms / 1000, ms % 1000)
}

/// Log the status surface through klog.
pub fn dump_state() {
    // Fragments arrive piecemeal from the formatter; assemble whole lines
    // before handing them to klog (which appends the newline itself).
    struct KlogLines {
        buf: [u8; 200],
        len: usize,
    }

    impl KlogLines {
        fn flush(&mut self) {
            if self.len != 0 {
                let line = core::str::from_utf8(&self.buf[..self.len]).unwrap_or("?");
                klog_info!("{}", line);
                self.len = 0;
            }
        }
    }

    impl Write for KlogLines {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                if b == b'\n' {
                    self.flush();
                } else {
                    if self.len == self.buf.len() {
                        self.flush();
                    }
                    self.buf[self.len] = b;
                    self.len += 1;
                }
            }
            Ok(())
        }
    }

    klog_info!("=== TIMER STATE DUMP ===");
    let mut lines = KlogLines {
        buf: [0; 200],
        len: 0,
    };
    if write_status(&mut lines).is_err() {
        lines.flush();
        klog_info!("=== TIMER STATE DUMP TRUNCATED ===");
        return;
    }
    lines.flush();
    klog_info!("=== END TIMER STATE DUMP ===");
}
