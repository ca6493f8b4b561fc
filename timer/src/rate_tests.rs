//! Interrupt-context tests for unit conversion against the live time
//! source.

use vexo_lib::testing::TestResult;
use vexo_lib::{assert_eq_test, assert_test, define_test_suite, pass};

use crate::rate::{self, RateConv};
use crate::timer::{self, TimerConfig};
use crate::source;

fn ensure_init() {
    timer::init(&TimerConfig::default());
}

pub fn test_unit_tables_round_trip() -> TestResult {
    ensure_init();

    for us in [100u64, 1_000, 10_000, 1_000_000] {
        let tc = rate::us_to_tc(us);
        assert_test!(tc > 0, "us_to_tc({}) is nonzero", us);
        let back = rate::tc_to_us(tc);
        assert_test!(
            back.abs_diff(us) <= 1,
            "round trip {} us -> {} tc -> {} us",
            us,
            tc,
            back
        );
    }

    pass!()
}

pub fn test_unit_tables_are_consistent() -> TestResult {
    ensure_init();

    let ms_tc = rate::ms_to_tc(10);
    let us_tc = rate::us_to_tc(10_000);
    assert_test!(
        ms_tc.abs_diff(us_tc) <= 16,
        "10 ms and 10000 us agree: {} vs {} tc",
        ms_tc,
        us_tc
    );

    let ns_tc = rate::ns_to_tc(1_000_000_000);
    let hz = source::cycles_per_second();
    assert_test!(
        ns_tc.abs_diff(hz) <= hz / 1_000_000 + 1,
        "one second of ns is one second of cycles: {} vs {}",
        ns_tc,
        hz
    );

    pass!()
}

pub fn test_identity_conversion_short_circuits() -> TestResult {
    let hz = source::cycles_per_second().max(1);
    let conv = RateConv::compute(0, hz, 0, hz);
    assert_test!(conv.is_identity(), "same-rate conversion is the identity");
    assert_eq_test!(conv.apply(0xDEAD_BEEF), 0xDEAD_BEEF, "identity preserves values");

    pass!()
}

pub fn test_now_is_monotonic() -> TestResult {
    ensure_init();

    let mut last = source::now();
    for _ in 0..10_000 {
        let cur = source::now();
        assert_test!(cur >= last, "time source went backwards: {} < {}", cur, last);
        last = cur;
    }

    pass!()
}

define_test_suite!(
    timer_rate,
    [
        test_unit_tables_round_trip,
        test_unit_tables_are_consistent,
        test_identity_conversion_short_circuits,
        test_now_is_monotonic,
    ]
);
