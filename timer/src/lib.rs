//! Deferred-callback (timer) subsystem of the vexo hypervisor kernel.
//!
//! A high-resolution, per-PCPU timing facility: callbacks scheduled at
//! absolute deadlines (one-shot) or on a period, addressed by 64-bit
//! generation-tagged handles that make stale references and slot reuse
//! benign, evaluated opportunistically at bottom-half points and backstopped
//! by the hard tick.
//!
//! Module map:
//!
//! - [`source`] — the monotonic time source (TSC / cross-chip counter /
//!   divided TSC) behind one indirect call;
//! - [`rate`] — integer mult/shift unit conversion, computed once;
//! - [`handle`] — handle encoding and the generation discipline;
//! - [`wheel`] — the per-PCPU slab + sorted-spoke wheel;
//! - [`timer`] — the public add/remove/modify/inspect API, groups, jiffies,
//!   time-of-day, the period tunable;
//! - [`tick`] — hard-interrupt and bottom-half entry points;
//! - [`pseudo_tsc`] — cross-PCPU reconciliation of the virtualized TSC;
//! - [`status`] — diagnostic status and uptime surfaces;
//! - [`post`] — the power-on self-test.

#![no_std]

pub mod handle;
pub mod post;
pub mod pseudo_tsc;
pub mod rate;
pub mod source;
pub mod status;
pub mod tick;
pub mod timer;
pub mod wheel;

#[cfg(feature = "itests")]
pub mod rate_tests;
#[cfg(feature = "itests")]
pub mod timer_tests;

pub use handle::TimerHandle;
pub use rate::RateConv;
pub use source::TimeSourceKind;
pub use timer::{
    DEFAULT_PERIOD_US, GroupId, TIMER_MIN_PERIOD_US, TimerConfig, add, add_group, add_hires,
    add_ms, create_group, get_timeout, init, interrupt_period_us, is_initialized, jiffies, modify,
    pending, remove, remove_group, remove_sync, set_interrupt_period_us, set_time_of_day_us,
    time_of_day_us,
};
pub use wheel::{MAX_TIMERS, NUM_SPOKES, TimerCallback, TimerFlags};
