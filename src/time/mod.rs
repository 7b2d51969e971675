/*
 * Time Base
 *
 * A monotonic jiffies counter at SYS_HZ, driven by the platform timer
 * interrupt. Every tick charges the running thread one jiffy of quantum
 * and runs the scheduler housekeeping cadence: priority boost, quantum
 * adjustment, and timer-expiry wakeups. Load balancing runs in its own
 * builtin thread on the balance interval.
 */

pub mod posix;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::percpu;
use crate::scheduler::{config, mlfq};

/// Ticks per second.
pub const SYS_HZ: u64 = 1000;

static JIFFIES: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

pub const fn jiffies_from_ms(ms: u64) -> u64 {
    ms * SYS_HZ / 1000
}

pub const fn jiffies_from_s(s: u64) -> u64 {
    s * SYS_HZ
}

pub const fn jiffies_to_ms(jiffies: u64) -> u64 {
    jiffies * 1000 / SYS_HZ
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    jiffies_to_ms(jiffies())
}

/// Second/nanosecond interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub const fn from_ms(ms: u64) -> Self {
        TimeSpec { sec: (ms / 1000) as i64, nsec: ((ms % 1000) * 1_000_000) as i64 }
    }

    pub fn valid(&self) -> bool {
        self.sec >= 0 && self.nsec >= 0 && self.nsec < 1_000_000_000
    }
}

/// Interval to ticks, rounding up so short timeouts never vanish.
pub fn jiffies_from_timespec(ts: &TimeSpec) -> u64 {
    let ns_total = ts.sec as u64 * 1_000_000_000 + ts.nsec as u64;
    let per_tick = 1_000_000_000 / SYS_HZ;
    ns_total.div_ceil(per_tick)
}

pub fn timespec_from_jiffies(jiffies: u64) -> TimeSpec {
    let ms = jiffies_to_ms(jiffies);
    TimeSpec::from_ms(ms)
}

/// One timer tick. Called from the timer interrupt (or a simulation
/// harness): advances jiffies, burns the running thread's quantum, and
/// runs the periodic housekeeping.
pub fn tick() {
    let now = JIFFIES.fetch_add(1, Ordering::Relaxed) + 1;

    if let Some(current) = percpu::current() {
        current.timeslice_drop();
    }

    let boost_every = jiffies_from_ms(config::boost_interval_ms()).max(1);
    if now % boost_every == 0 {
        for cpu in 0..percpu::online() {
            mlfq::priority_boost(cpu);
        }
    }

    let adjust_every = jiffies_from_ms(config::quantum_adjust_interval_ms()).max(1);
    if now % adjust_every == 0 {
        for cpu in 0..percpu::online() {
            mlfq::adjust_quantum(cpu);
        }
    }

    posix::check_expiry(now);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_round_trip() {
        assert_eq!(jiffies_from_ms(30), 30);
        assert_eq!(jiffies_from_s(3), 3000);
        assert_eq!(jiffies_to_ms(jiffies_from_ms(250)), 250);
    }

    #[test]
    fn timespec_conversion_rounds_up() {
        let ts = TimeSpec { sec: 0, nsec: 1 };
        assert_eq!(jiffies_from_timespec(&ts), 1);
        let ts = TimeSpec { sec: 1, nsec: 500_000_000 };
        assert_eq!(jiffies_from_timespec(&ts), 1500);
    }
}
