//! Atomic sleep and wakeup.
//!
//! `wait_on` is the single blocking primitive: it enqueues the current
//! thread on a wait queue, moves it to the requested blocked state,
//! releases the caller's lock, and yields to the scheduler — then
//! re-acquires the lock and reports why the thread was resumed.
//! Await-events, condition variables and the signal wait paths are all
//! built on it.

use alloc::sync::Arc;

use crate::KResult;
use crate::ds::queue::Whence;
use crate::errno::Error;
use crate::percpu;
use crate::scheduler;
use crate::scheduler::thread::{Thread, ThreadQueue, ThreadState, WakeReason};
use crate::sync::spinlock::SpinGuard;

/// Block the current thread on `wq` in `state`, dropping `guard` for the
/// duration of the sleep. Returns the re-acquired guard and `Err(Intr)`
/// when the sleep was broken by cancellation or a signal.
pub fn wait_on<'a, T>(
    wq: &Arc<ThreadQueue>,
    state: ThreadState,
    guard: SpinGuard<'a, T>,
) -> (SpinGuard<'a, T>, KResult<()>) {
    debug_assert!(matches!(state, ThreadState::Sleep | ThreadState::Stopped));

    let thread = percpu::current().expect("wait_on with no current thread");

    {
        let mut q = wq.lock();
        let mut inner = thread.lock();
        inner.wakeup = WakeReason::Normal;
        inner.state = state;
        inner.wait_queue = Some(wq.clone());
        q.enqueue(thread.clone(), true).expect("thread already on a wait queue");
    }

    let (guard, ()) = guard.unlocked(|| scheduler::reschedule());

    let reason = {
        let mut inner = thread.lock();
        inner.wait_queue = None;
        inner.wakeup
    };

    let result = match reason {
        WakeReason::Normal => Ok(()),
        WakeReason::Interrupt => Err(Error::Intr),
        WakeReason::Timeout => Err(Error::TimedOut),
        WakeReason::Error => Err(Error::NoEnt),
    };
    (guard, result)
}

/// Make one dequeued waiter runnable again.
fn resume(thread: Arc<Thread>, reason: WakeReason) {
    {
        let mut inner = thread.lock();
        inner.wakeup = reason;
        inner.wait_queue = None;
        inner.state = ThreadState::Ready;
    }
    scheduler::enqueue_ready(&thread);
}

/// Wake one waiter from `wq`, taken from `whence`. `NoEnt` if empty.
pub fn wakeup_on(wq: &ThreadQueue, reason: WakeReason, whence: Whence) -> KResult<()> {
    let thread = wq.lock().dequeue_whence(whence)?;
    resume(thread, reason);
    Ok(())
}

/// Wake every waiter on `wq` in FIFO order; returns how many were woken.
pub fn wakeup_all_on(wq: &ThreadQueue, reason: WakeReason) -> usize {
    let mut count = 0;
    loop {
        let next = wq.lock().dequeue();
        match next {
            Ok(thread) => {
                resume(thread, reason);
                count += 1;
            }
            Err(_) => return count,
        }
    }
}
