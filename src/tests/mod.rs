/*
 * In-Kernel Test Suites
 *
 * Runtime validation of the core, driven from the shell (`tests`) or the
 * boot path. Each suite logs pass/fail counts; the scheduler suites
 * spawn real threads and exercise context switching, so they only make
 * sense on the bare-metal build — the pure-logic equivalents live in
 * the unit tests beside each module.
 */

pub mod signal_tests;
pub mod vm_tests;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Shared pass/fail tally for one suite run.
pub struct TestTally {
    passed: AtomicUsize,
    failed: AtomicUsize,
}

impl TestTally {
    pub const fn new() -> Self {
        TestTally { passed: AtomicUsize::new(0), failed: AtomicUsize::new(0) }
    }

    pub fn check(&self, name: &str, ok: bool) {
        if ok {
            self.passed.fetch_add(1, Ordering::Relaxed);
            log::info!("[ok] {}", name);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            log::error!("[FAILED] {}", name);
        }
    }

    pub fn report(&self, suite: &str) -> bool {
        let passed = self.passed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        log::info!("{}: {} passed, {} failed", suite, passed, failed);
        failed == 0
    }
}

/// Run every suite; logs a summary.
pub fn run_all() {
    log::info!("==== in-kernel test suites ====");
    let mut ok = true;
    ok &= vm_tests::run();
    ok &= signal_tests::run();
    ok &= sched_tests::run();
    if ok {
        log::info!("==== all suites passed ====");
    } else {
        log::error!("==== suite failures, see log above ====");
    }
}
