use crate::testing::TestResult;
use crate::{klog_debug, klog_info};

/// Execute a single test function, logging the outcome.
///
/// Failures are logged at Info so they show up in the default boot log;
/// passes only at Debug to keep the happy path quiet.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    klog_debug!("TEST: running {}", name);
    let result = test();
    match result {
        TestResult::Pass => klog_debug!("TEST: {} ... ok", name),
        TestResult::Fail => klog_info!("TEST: {} ... FAILED", name),
        TestResult::Skipped => klog_debug!("TEST: {} ... skipped", name),
    }
    result
}
