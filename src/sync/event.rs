//! Counting await-event.
//!
//! The counter is the whole story: positive values are credited events
//! waiting for consumers, negative values are consumers waiting for
//! events. `await_event` consumes a credit or registers as a waiter;
//! `wakeup` pays one waiter or banks a credit.

use alloc::sync::Arc;

use crate::KResult;
use crate::ds::queue::{Queue, Whence};
use crate::errno::Error;
use crate::scheduler::thread::{ThreadQueue, ThreadState, WakeReason};
use crate::scheduler::wait;
use crate::sync::spinlock::SpinLock;
use crate::time::{self, TimeSpec};

pub struct AwaitEvent {
    /// > 0: events credited; < 0: waiters pending.
    count: SpinLock<i64>,
    waiters: Arc<ThreadQueue>,
}

impl AwaitEvent {
    pub fn new() -> Self {
        AwaitEvent { count: SpinLock::new(0), waiters: Arc::new(Queue::new()) }
    }

    /// Current counter value.
    pub fn pending(&self) -> i64 {
        *self.count.lock()
    }

    /// Consume one credited event without blocking; `Again` if none.
    pub fn try_await(&self) -> KResult<()> {
        let mut count = self.count.lock();
        if *count <= 0 {
            return Err(Error::Again);
        }
        *count -= 1;
        Ok(())
    }

    /// Wait for one event.
    pub fn await_event(&self) -> KResult<()> {
        self.await_event_timed(None)
    }

    /// Wait for one event, giving up after `timeout` if provided. The
    /// deadline is computed once up front.
    pub fn await_event_timed(&self, timeout: Option<TimeSpec>) -> KResult<()> {
        let mut count = self.count.lock();

        // Fast path: event already credited.
        if *count > 0 {
            *count -= 1;
            return Ok(());
        }

        // Register as a waiter; `old` marks the registered level, so any
        // later credit makes `*count > old`.
        *count -= 1;
        let old = *count;
        let mut ret = Ok(());

        match timeout {
            None => {
                while *count == old {
                    let (reacquired, woke) = wait::wait_on(&self.waiters, ThreadState::Sleep, count);
                    count = reacquired;
                    if let Err(err) = woke {
                        ret = Err(err);
                        break;
                    }
                }
            }
            Some(timeout) => {
                let deadline = time::jiffies() + time::jiffies_from_timespec(&timeout);
                let timer = time::posix::arm_thread_wakeup(deadline);
                while *count == old && deadline > time::jiffies() {
                    let (reacquired, woke) = wait::wait_on(&self.waiters, ThreadState::Sleep, count);
                    count = reacquired;
                    if let Err(err) = woke {
                        if err != Error::TimedOut {
                            ret = Err(err);
                        }
                        break;
                    }
                }
                if let Ok(id) = timer {
                    let _ = time::posix::timer_delete(id);
                }
                if ret.is_ok() && *count == old && deadline <= time::jiffies() {
                    ret = Err(Error::TimedOut);
                }
            }
        }

        if ret.is_ok() && *count > old {
            return Ok(());
        }
        if ret.is_err() {
            // Withdraw the waiter registration.
            *count += 1;
        }
        ret
    }

    /// Credit one event, paying the longest waiter if one is pending.
    pub fn wakeup(&self) {
        let mut count = self.count.lock();
        if *count < 0 {
            let _ = wait::wakeup_on(&self.waiters, WakeReason::Normal, Whence::Head);
        }
        *count += 1;
    }

    /// Credit every pending waiter one event; with no waiters, bank a
    /// single credit.
    pub fn wakeup_all(&self) {
        let mut count = self.count.lock();
        if *count < 0 {
            *count = -*count;
            wait::wakeup_all_on(&self.waiters, WakeReason::Normal);
        } else {
            *count += 1;
        }
    }

    /// Fail every waiter and reset the counter.
    pub fn destroy(&self) {
        let mut count = self.count.lock();
        if *count < 0 {
            wait::wakeup_all_on(&self.waiters, WakeReason::Error);
            *count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_await_consumes_credits() {
        let ev = AwaitEvent::new();
        assert_eq!(ev.try_await(), Err(Error::Again));
        ev.wakeup();
        ev.wakeup();
        assert_eq!(ev.pending(), 2);
        ev.try_await().unwrap();
        ev.try_await().unwrap();
        assert_eq!(ev.try_await(), Err(Error::Again));
        assert_eq!(ev.pending(), 0);
    }

    #[test]
    fn wakeups_without_waiters_accumulate() {
        // min(N, M) pairing, the credited half: M wakeups satisfy the
        // next M awaits exactly.
        let ev = AwaitEvent::new();
        for _ in 0..5 {
            ev.wakeup();
        }
        let mut served = 0;
        while ev.try_await().is_ok() {
            served += 1;
        }
        assert_eq!(served, 5);
    }

    #[test]
    fn wakeup_all_banks_single_credit_when_idle() {
        let ev = AwaitEvent::new();
        ev.wakeup_all();
        ev.wakeup_all();
        // Without waiters each broadcast banks one credit.
        assert_eq!(ev.pending(), 2);
    }

    #[test]
    fn destroy_resets_only_waiter_debt() {
        let ev = AwaitEvent::new();
        ev.wakeup();
        ev.destroy();
        // Credits survive destruction; only waiters are flushed.
        assert_eq!(ev.pending(), 1);
    }
}
