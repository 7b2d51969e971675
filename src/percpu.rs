//! Per-CPU state.
//!
//! The original design reached scheduler state through free-standing
//! mutable globals (`cpu`, `current`). Here every per-CPU datum lives in
//! one [`Cpu`] record reached through an explicit accessor, and the
//! "current thread" is a field of that record rather than a global.
//!
//! The scheduler-context slot is only touched by the owning CPU with
//! interrupts disabled; the current-thread slot is lock-protected so
//! diagnostic readers on other CPUs get a coherent handle.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use alloc::sync::Arc;

use crate::arch::x86_64::context::Context;
use crate::scheduler::thread::Thread;
use crate::sync::spinlock::SpinLock;

/// Upper bound on supported CPUs. The MLFQ array and balancer iterate
/// over `online()` entries only.
pub const MAX_CPUS: usize = 16;

/// One processor's kernel-private state.
pub struct Cpu {
    pub id: usize,
    /// `pushcli` nesting depth.
    pub ncli: AtomicI64,
    /// Whether interrupts were enabled before the outermost `pushcli`.
    pub intena: AtomicBool,
    /// Thread currently executing on this CPU, if any.
    current: SpinLock<Option<Arc<Thread>>>,
    /// Saved context of this CPU's scheduler loop; `reschedule` switches
    /// to it, the dispatch path switches away from it.
    sched_ctx: UnsafeCell<*mut Context>,
}

// The context slot is only mutated by the owning CPU with interrupts
// disabled.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new(id: usize) -> Self {
        Cpu {
            id,
            ncli: AtomicI64::new(0),
            intena: AtomicBool::new(false),
            current: SpinLock::new(None),
            sched_ctx: UnsafeCell::new(core::ptr::null_mut()),
        }
    }

    /// Scheduler-context slot, handed to the context switch primitive.
    pub fn sched_ctx_slot(&self) -> *mut *mut Context {
        self.sched_ctx.get()
    }
}

macro_rules! cpu_array {
    ($($i:literal),+) => { [$(Cpu::new($i)),+] };
}

static CPUS: [Cpu; MAX_CPUS] = cpu_array![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

static ONLINE: AtomicUsize = AtomicUsize::new(1);

/// Identifier of the executing CPU.
///
/// Application processors are parked during bring-up, so kernel
/// execution is pinned to the bootstrap processor; scheduler code that
/// operates on other CPUs' queues takes an explicit CPU index instead of
/// relying on this.
pub fn cpu_id() -> usize {
    0
}

/// The executing CPU's record.
pub fn this_cpu() -> &'static Cpu {
    &CPUS[cpu_id()]
}

/// A specific CPU's record.
pub fn cpu(id: usize) -> &'static Cpu {
    &CPUS[id]
}

/// Number of CPUs participating in scheduling.
pub fn online() -> usize {
    ONLINE.load(Ordering::Relaxed)
}

/// Record the number of schedulable CPUs. Clamped to [`MAX_CPUS`].
pub fn set_online(n: usize) {
    ONLINE.store(n.clamp(1, MAX_CPUS), Ordering::Relaxed);
}

/// Clone the executing CPU's current-thread handle.
pub fn current() -> Option<Arc<Thread>> {
    this_cpu().current.lock().clone()
}

/// Install a new current thread on the executing CPU, returning the old
/// one.
pub fn set_current(thread: Option<Arc<Thread>>) -> Option<Arc<Thread>> {
    core::mem::replace(&mut *this_cpu().current.lock(), thread)
}
