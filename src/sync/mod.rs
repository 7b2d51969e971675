/*
 * Synchronization Primitives
 *
 * The kernel's locking and waiting substrate: the IRQ-disabling spinlock,
 * the counting await-event, and the condition variable. Queues, threads,
 * address spaces and signal records all embed the spinlock; blocking is
 * always routed through the scheduler's wait/wakeup entry points.
 */

pub mod cond;
pub mod event;
pub mod spinlock;

pub use cond::Cond;
pub use event::AwaitEvent;
pub use spinlock::{SpinGuard, SpinLock};
