//! Interrupt flag control and the `pushcli`/`popcli` nesting protocol.
//!
//! Every spinlock acquisition disables local interrupts for its duration.
//! `pushcli`/`popcli` make that composable: the first `pushcli` records
//! whether interrupts were enabled, nested calls only bump a depth counter,
//! and the matching outermost `popcli` restores the saved state.
//!
//! Hosted builds shadow the interrupt flag in an atomic so the exact same
//! locking code runs under the test harness.

use core::sync::atomic::Ordering;

use crate::percpu;

#[cfg(target_os = "none")]
mod hw {
    #[inline(always)]
    pub fn enabled() -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }

    #[inline(always)]
    pub fn enable() {
        x86_64::instructions::interrupts::enable();
    }

    #[inline(always)]
    pub fn disable() {
        x86_64::instructions::interrupts::disable();
    }
}

#[cfg(not(target_os = "none"))]
mod hw {
    use core::sync::atomic::{AtomicBool, Ordering};

    static SHADOW_IF: AtomicBool = AtomicBool::new(true);

    #[inline(always)]
    pub fn enabled() -> bool {
        SHADOW_IF.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn enable() {
        SHADOW_IF.store(true, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn disable() {
        SHADOW_IF.store(false, Ordering::Relaxed);
    }
}

/// Whether local interrupts are enabled.
#[inline(always)]
pub fn enabled() -> bool {
    hw::enabled()
}

/// Enable local interrupts.
#[inline(always)]
pub fn enable() {
    hw::enable();
}

/// Disable local interrupts.
#[inline(always)]
pub fn disable() {
    hw::disable();
}

/// Disable interrupts and bump the per-CPU nesting depth, recording the
/// prior interrupt state on the outermost call.
pub fn pushcli() {
    let was_enabled = hw::enabled();
    hw::disable();

    let cpu = percpu::this_cpu();
    if cpu.ncli.fetch_add(1, Ordering::Relaxed) == 0 {
        cpu.intena.store(was_enabled, Ordering::Relaxed);
    }
}

/// Drop one level of `pushcli` nesting; the outermost call re-enables
/// interrupts if they were enabled before the outermost `pushcli`.
pub fn popcli() {
    let cpu = percpu::this_cpu();

    #[cfg(target_os = "none")]
    {
        debug_assert!(!hw::enabled(), "popcli with interrupts enabled");
        debug_assert!(cpu.ncli.load(Ordering::Relaxed) > 0, "unbalanced popcli");
    }

    if cpu.ncli.fetch_sub(1, Ordering::Relaxed) == 1 && cpu.intena.load(Ordering::Relaxed) {
        hw::enable();
    }
}

/// Run `f` with interrupts disabled, restoring the prior state afterwards.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    pushcli();
    let r = f();
    popcli();
    r
}

