/*
 * CORVUS Kernel Core
 *
 * This library is the kernel core of CORVUS: the per-CPU MLFQ scheduler,
 * thread and process lifecycle, POSIX-style signal delivery, IRQ-safe
 * synchronization primitives, and the virtual-memory region manager.
 *
 * The crate is split in two:
 * - this library, which is `no_std` and contains every subsystem, so the
 *   pure-logic parts (queues, bitmap, hashmap, MLFQ policy, region manager,
 *   signal queues) build and unit-test on a hosted target;
 * - the `corvus-kernel` binary, which owns the bare-metal entry point,
 *   panic handler and heap bring-up.
 *
 * Hardware-touching paths (CLI/STI, HLT, port I/O, CR3, the context switch)
 * are real when building for `target_os = "none"` and are replaced by inert
 * equivalents elsewhere, so the same subsystem code is exercised either way.
 */

#![no_std]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(test)]
pub mod test_support {
    //! Serialization for tests that touch global scheduler state (the
    //! per-CPU MLFQ array, the online-CPU count).
    pub static SCHED_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());
}

pub mod arch;
pub mod builtin;
pub mod console;
pub mod ds;
pub mod errno;
pub mod memory;
pub mod percpu;
pub mod scheduler;
pub mod shell;
pub mod signal;
pub mod sync;
pub mod tests;
pub mod time;
pub mod utils;

pub use errno::Error;

/// Kernel result type used by every fallible public operation.
pub type KResult<T> = core::result::Result<T, Error>;
