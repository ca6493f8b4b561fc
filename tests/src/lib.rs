//! In-kernel test registry for the timer subsystem.
//!
//! Bring-up calls [`tests_register_system_suites`] once the timer module is
//! initialized, then [`tests_run_all`] from the boot PCPU's test world.
//! Suites come from `vexo-timer` compiled with the `itests` feature.

#![no_std]

use vexo_lib::spinlock::IrqMutex;
use vexo_lib::testing::{
    HARNESS_MAX_SUITES, TestConfig, TestRunSummary, TestSuiteDesc, TestSuiteResult,
};
use vexo_lib::klog_info;

pub use vexo_lib::testing::Verbosity;

pub const TESTS_MAX_SUITES: usize = HARNESS_MAX_SUITES;

struct Registry {
    suites: [Option<&'static TestSuiteDesc>; TESTS_MAX_SUITES],
    count: usize,
}

static REGISTRY: IrqMutex<Registry> = IrqMutex::new(Registry {
    suites: [None; TESTS_MAX_SUITES],
    count: 0,
});

pub fn tests_reset_registry() {
    let mut reg = REGISTRY.lock();
    reg.suites = [None; TESTS_MAX_SUITES];
    reg.count = 0;
}

pub fn tests_register_suite(desc: &'static TestSuiteDesc) -> i32 {
    let mut reg = REGISTRY.lock();
    if reg.count >= TESTS_MAX_SUITES {
        return -1;
    }
    let count = reg.count;
    reg.suites[count] = Some(desc);
    reg.count = count + 1;
    0
}

/// Register every suite the subsystem ships.
pub fn tests_register_system_suites() {
    let _ = tests_register_suite(&vexo_timer::timer_tests::TIMER_CORE_SUITE);
    let _ = tests_register_suite(&vexo_timer::rate_tests::TIMER_RATE_SUITE);
}

/// Run all registered suites, filling `summary`.  Returns 0 when every
/// suite passed.
pub fn tests_run_all(config: &TestConfig, summary: &mut TestRunSummary) -> i32 {
    *summary = TestRunSummary::default();

    if !config.enabled {
        klog_info!("TESTS: harness disabled");
        return 0;
    }

    // Snapshot the descriptors so suites run without the registry lock
    // (they take wheel locks and spin on the clock).
    let (suites, count) = {
        let reg = REGISTRY.lock();
        (reg.suites, reg.count)
    };

    let mut failures = 0u32;
    for desc in suites.iter().take(count).flatten() {
        klog_info!("TESTS: suite {}", desc.name);
        let mut result = TestSuiteResult::default();
        if (desc.run)(&mut result) != 0 {
            failures += 1;
        }
        klog_info!(
            "TESTS: suite {} - {}/{} passed in {} ms",
            desc.name,
            result.passed,
            result.total,
            result.elapsed_ms,
        );
        summary.add_suite_result(&result);
    }

    klog_info!(
        "TESTS: {} suites, {}/{} tests passed",
        summary.suite_count,
        summary.passed,
        summary.total_tests,
    );
    if failures == 0 { 0 } else { -1 }
}
