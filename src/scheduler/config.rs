//! Tunable scheduling parameters.
//!
//! The aging threshold, boost interval, balance interval and quantum
//! bounds are runtime configuration rather than compile-time constants;
//! the shell and tests adjust them through these accessors.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Run-queue passes a waiting thread may age before promotion.
static AGING_THRESHOLD: AtomicU32 = AtomicU32::new(100);

/// Wall-time between priority boosts, in milliseconds.
static BOOST_INTERVAL_MS: AtomicU64 = AtomicU64::new(3000);

/// Wall-time between load-balance passes, in milliseconds.
static BALANCE_INTERVAL_MS: AtomicU64 = AtomicU64::new(1);

/// Wall-time between quantum adjustments, in milliseconds.
static QUANTUM_ADJUST_INTERVAL_MS: AtomicU64 = AtomicU64::new(1000);

/// Bounds a level quantum may be adjusted within, in milliseconds.
pub const QUANTUM_MIN_MS: u64 = 10;
pub const QUANTUM_MAX_MS: u64 = 50;

pub fn aging_threshold() -> u32 {
    AGING_THRESHOLD.load(Ordering::Relaxed)
}

pub fn set_aging_threshold(ticks: u32) {
    AGING_THRESHOLD.store(ticks.max(1), Ordering::Relaxed);
}

pub fn boost_interval_ms() -> u64 {
    BOOST_INTERVAL_MS.load(Ordering::Relaxed)
}

pub fn set_boost_interval_ms(ms: u64) {
    BOOST_INTERVAL_MS.store(ms.max(1), Ordering::Relaxed);
}

pub fn balance_interval_ms() -> u64 {
    BALANCE_INTERVAL_MS.load(Ordering::Relaxed)
}

pub fn set_balance_interval_ms(ms: u64) {
    BALANCE_INTERVAL_MS.store(ms.max(1), Ordering::Relaxed);
}

pub fn quantum_adjust_interval_ms() -> u64 {
    QUANTUM_ADJUST_INTERVAL_MS.load(Ordering::Relaxed)
}

pub fn set_quantum_adjust_interval_ms(ms: u64) {
    QUANTUM_ADJUST_INTERVAL_MS.store(ms.max(1), Ordering::Relaxed);
}
