//! Per-thread scheduling metrics.
//!
//! Updated by the scheduler loop around every dispatch: count and stamp
//! dispatches on the way in, charge consumed quantum on the way out.

use alloc::sync::Arc;

use crate::scheduler::thread::{Thread, ThreadState};
use crate::time;

/// The thread is about to run.
pub fn on_dispatch(thread: &Arc<Thread>) {
    let mut inner = thread.lock();
    inner.sched.sched_count += 1;
    inner.sched.last_sched = time::jiffies();
    inner.sched.last_timeslice = thread.timeslice();
}

/// The thread gave the CPU back; charge it what it consumed.
pub fn on_return(thread: &Arc<Thread>) {
    let mut inner = thread.lock();
    let consumed = inner.sched.last_timeslice.saturating_sub(thread.timeslice());
    inner.sched.cpu_time += consumed;
    inner.sched.total_time += consumed;
    if matches!(inner.state, ThreadState::Zombie | ThreadState::Terminated) {
        inner.sched.exit_time = time::jiffies();
    }
}
