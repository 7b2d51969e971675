//! Pending-signal bookkeeping.
//!
//! Each signal number has its own FIFO of occurrences, at two scopes:
//! per-thread queues inside the thread, and process-wide queues in the
//! shared [`SignalDesc`]. The pending bits are sticky — set when an
//! occurrence is queued, cleared only when the matching queue drains.
//!
//! Lock order: thread lock, then the signal-record lock, then the
//! per-signal queue lock innermost.

use alloc::sync::Arc;

use crate::KResult;
use crate::ds::queue::Queue;
use crate::errno::Error;
use crate::scheduler::thread::{SigQueue, Thread, ThreadInner};
use crate::signal::{NSIG, SigAction, SigInfo, SigSet, sig_bad};
use crate::sync::spinlock::{SpinGuard, SpinLock};
use crate::scheduler::thread::ThreadQueue;

/// Shared, process-scope signal state.
pub struct SigDescState {
    /// Shared signal mask.
    pub mask: SigSet,
    /// Process-wide sticky pending set.
    pub pending: SigSet,
    /// Action table shared by the whole group.
    pub actions: [SigAction; NSIG],
}

/// The process-level signal record.
pub struct SignalDesc {
    state: SpinLock<SigDescState>,
    queues: [SigQueue; NSIG],
    /// Threads sleeping in `sigwaitinfo`/`pause`.
    pub waiters: Arc<ThreadQueue>,
}

impl SignalDesc {
    pub fn alloc() -> Arc<SignalDesc> {
        Arc::new(SignalDesc {
            state: SpinLock::new(SigDescState {
                mask: SigSet::empty(),
                pending: SigSet::empty(),
                actions: [SigAction::default(); NSIG],
            }),
            queues: [const { Queue::new() }; NSIG],
            waiters: Arc::new(Queue::new()),
        })
    }

    pub fn lock_state(&self) -> SpinGuard<'_, SigDescState> {
        self.state.lock()
    }

    pub fn action(&self, signo: usize) -> SigAction {
        self.state.lock().actions[signo - 1]
    }

    pub fn set_action(&self, signo: usize, act: SigAction) -> SigAction {
        let mut state = self.state.lock();
        core::mem::replace(&mut state.actions[signo - 1], act)
    }

    /// Inherit the action table, as fork does.
    pub fn copy_actions_from(&self, other: &SignalDesc) {
        let src = other.state.lock();
        let actions = src.actions;
        drop(src);
        self.state.lock().actions = actions;
    }

    pub fn pending(&self) -> SigSet {
        self.state.lock().pending
    }

    /// Queue a process-directed occurrence: pending bit first, then the
    /// record, FIFO within the signal number.
    pub fn enqueue(&self, info: SigInfo) -> KResult<()> {
        if sig_bad(info.signo) {
            return Err(Error::Inval);
        }
        let signo = info.signo;
        let mut state = self.state.lock();
        state.pending.add(signo);
        let mut q = self.queues[signo - 1].lock();
        if let Err(err) = q.enqueue(info, false) {
            if q.is_empty() {
                state.pending.del(signo);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Pop the oldest occurrence of `signo` from the process queues,
    /// clearing the pending bit when the queue drains. The caller holds
    /// the state lock.
    fn dequeue_signo(&self, state: &mut SigDescState, signo: usize) -> KResult<SigInfo> {
        let mut q = self.queues[signo - 1].lock();
        let info = q.dequeue();
        if q.is_empty() {
            state.pending.del(signo);
        }
        info
    }
}

/// Queue a thread-directed occurrence onto `inner`'s per-signal queue.
/// The caller holds the thread lock and passes its witness.
pub fn thread_sigenqueue(thread: &Thread, inner: &mut ThreadInner, info: SigInfo) -> KResult<()> {
    if sig_bad(info.signo) {
        return Err(Error::Inval);
    }
    let signo = info.signo;
    inner.sigpending.add(signo);
    let mut q = thread.sigqueue[signo - 1].lock();
    if let Err(err) = q.enqueue(info, false) {
        if q.is_empty() {
            inner.sigpending.del(signo);
        }
        return Err(err);
    }
    Ok(())
}

/// Dequeue the next deliverable signal for `thread`: thread-directed
/// occurrences first, then process-directed, lowest signal number first,
/// FIFO within a number. Returns the occurrence plus a snapshot of its
/// current action.
pub fn signal_dequeue(thread: &Arc<Thread>) -> Option<(SigInfo, SigAction)> {
    let mut inner = thread.lock();
    let desc = inner.signals.clone()?;
    let mut state = desc.lock_state();

    // Thread-directed first.
    let deliverable = inner.sigpending.subtract(inner.sigmask);
    if let Some(signo) = deliverable.first() {
        let mut q = thread.sigqueue[signo - 1].lock();
        let info = q.dequeue();
        if q.is_empty() {
            inner.sigpending.del(signo);
        }
        if let Ok(info) = info {
            let act = state.actions[signo - 1];
            return Some((info, act));
        }
    }

    // Then process-directed.
    let deliverable = state.pending.subtract(inner.sigmask);
    if let Some(signo) = deliverable.first() {
        let act = state.actions[signo - 1];
        if let Ok(info) = desc.dequeue_signo(&mut state, signo) {
            return Some((info, act));
        }
    }
    None
}

/// Dequeue the next pending signal from `set` regardless of the blocked
/// mask, bypassing dispositions. Backs `sigwaitinfo`.
pub fn signal_dequeue_from_set(thread: &Arc<Thread>, set: SigSet) -> Option<SigInfo> {
    let mut inner = thread.lock();
    let desc = inner.signals.clone()?;
    let mut state = desc.lock_state();

    if let Some(signo) = inner.sigpending.intersect(set).first() {
        let mut q = thread.sigqueue[signo - 1].lock();
        let info = q.dequeue();
        if q.is_empty() {
            inner.sigpending.del(signo);
        }
        if let Ok(info) = info {
            return Some(info);
        }
    }

    if let Some(signo) = state.pending.intersect(set).first() {
        if let Ok(info) = desc.dequeue_signo(&mut state, signo) {
            return Some(info);
        }
    }
    None
}

/// Union of the thread's and process's pending sets.
pub fn pending_union(thread: &Arc<Thread>) -> SigSet {
    let inner = thread.lock();
    let proc_pending = inner.signals.as_ref().map(|d| d.pending()).unwrap_or(SigSet::empty());
    inner.sigpending.union(proc_pending)
}
