//! Condition variable over a FIFO waiter queue.

use alloc::sync::Arc;

use crate::KResult;
use crate::ds::queue::{Queue, Whence};
use crate::scheduler::thread::{ThreadQueue, ThreadState, WakeReason};
use crate::scheduler::wait;
use crate::sync::spinlock::SpinGuard;

pub struct Cond {
    waiters: Arc<ThreadQueue>,
}

impl Cond {
    pub fn new() -> Self {
        Cond { waiters: Arc::new(Queue::new()) }
    }

    /// Sleep until signalled, dropping `guard` for the duration and
    /// re-acquiring it before returning. `Err(Intr)` when the sleep was
    /// broken by cancellation.
    pub fn wait<'a, T>(&self, guard: SpinGuard<'a, T>) -> (SpinGuard<'a, T>, KResult<()>) {
        wait::wait_on(&self.waiters, ThreadState::Sleep, guard)
    }

    /// Wake the longest waiter, if any.
    pub fn signal(&self) {
        let _ = wait::wakeup_on(&self.waiters, WakeReason::Normal, Whence::Head);
    }

    /// Wake every waiter in FIFO order; returns the number woken.
    pub fn broadcast(&self) -> usize {
        wait::wakeup_all_on(&self.waiters, WakeReason::Normal)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.count()
    }
}
